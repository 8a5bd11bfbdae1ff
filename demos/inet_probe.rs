//! Minimal sender/receiver probe over the transport core.
//!
//! Receiver:  cargo run --example inet_probe -- listen 9977
//! Sender:    cargo run --example inet_probe -- send 127.0.0.1 9977
//!
//! The sender transmits one 59 byte patterned datagram per second; the
//! receiver prints what it gets. Both sides drive the same cooperative
//! service loop from `main`.

use std::cell::RefCell;
use std::net::IpAddr;
use std::rc::Rc;
use std::time::Duration;

use anyhow::{bail, Context};

use netpoint::addr::{IpFamily, IpPacketInfo};
use netpoint::buffers::packet_buf::PacketBuf;
use netpoint::config::NetConfig;
use netpoint::end_point_pool::UdpHandle;
use netpoint::error::NetError;
use netpoint::events::UdpEvents;
use netpoint::transport::Transport;

const PROBE_SIZE: usize = 59;

struct PrintingSink {
    received: Rc<RefCell<u64>>,
}

impl UdpEvents for PrintingSink {
    fn on_message_received(
        &mut self,
        _net: &mut Transport,
        _ep: UdpHandle,
        buffer: PacketBuf,
        info: IpPacketInfo,
    ) {
        *self.received.borrow_mut() += buffer.total_len() as u64;
        println!(
            "{} bytes from {}:{} ({} total)",
            buffer.total_len(),
            info.src_addr,
            info.src_port,
            self.received.borrow()
        );
    }

    fn on_receive_error(
        &mut self,
        _net: &mut Transport,
        _ep: UdpHandle,
        error: NetError,
        _info: Option<IpPacketInfo>,
    ) {
        eprintln!("receive error: {}", error);
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().init();

    let args: Vec<String> = std::env::args().collect();
    match args.get(1).map(String::as_str) {
        Some("listen") => {
            let port: u16 = args
                .get(2)
                .context("usage: inet_probe listen <port>")?
                .parse()?;
            run_receiver(port)
        }
        Some("send") => {
            let addr: IpAddr = args
                .get(2)
                .context("usage: inet_probe send <addr> <port>")?
                .parse()?;
            let port: u16 = args
                .get(3)
                .context("usage: inet_probe send <addr> <port>")?
                .parse()?;
            run_sender(addr, port)
        }
        _ => bail!("usage: inet_probe listen <port> | inet_probe send <addr> <port>"),
    }
}

fn run_receiver(port: u16) -> anyhow::Result<()> {
    let mut net = Transport::new(NetConfig::default())?;
    let ep = net.new_udp_end_point(IpFamily::V4)?;
    net.udp_bind(ep, IpFamily::V4, IpFamily::V4.unspecified(), port)?;
    let received = Rc::new(RefCell::new(0));
    net.udp_listen(ep, Box::new(PrintingSink { received }))?;
    println!("listening on {}", net.udp_local_addr(ep)?);

    loop {
        net.service(Duration::from_millis(200))?;
    }
}

fn run_sender(addr: IpAddr, port: u16) -> anyhow::Result<()> {
    let mut net = Transport::new(NetConfig::default())?;
    let ep = net.new_udp_end_point(IpFamily::of(&addr))?;
    let payload: Vec<u8> = (0..PROBE_SIZE).map(|i| i as u8).collect();

    let mut sent = 0u64;
    loop {
        let buf = net.alloc_buffer(0)?;
        buf.put_slice(&payload)?;
        net.udp_send_to(ep, addr, port, buf)?;
        sent += payload.len() as u64;
        println!("{} bytes sent to {}:{}", sent, addr, port);

        let deadline = std::time::Instant::now() + Duration::from_secs(1);
        while std::time::Instant::now() < deadline {
            net.service(Duration::from_millis(100))?;
        }
    }
}
