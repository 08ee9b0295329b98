use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use tracing::{debug, info};

use crate::config::PortRange;
use crate::error::ParamedicError;

/// Checks whether a port can be bound right now.
pub trait PortProbe {
    /// `Ok(())` if the port is free. An `AddrInUse` error means "try the next
    /// one"; any other error aborts the scan.
    fn probe(&self, port: u16) -> io::Result<()>;
}

/// Probes by binding a throwaway listener on all interfaces, the same way the
/// result server will bind. The socket is closed as soon as it is dropped.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpProbe;

impl PortProbe for TcpProbe {
    fn probe(&self, port: u16) -> io::Result<()> {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
        let socket = socket2::Socket::new(
            socket2::Domain::IPV4,
            socket2::Type::STREAM,
            Some(socket2::Protocol::TCP),
        )?;
        socket.bind(&addr.into())?;
        socket.listen(1)?;
        Ok(())
    }
}

/// Scan `range` from its low end and return the first free port.
///
/// Probes each port at most once, so a range of N ports costs at most N
/// probes before failing with `NoPortsAvailable`.
pub fn find_available_port(range: PortRange, probe: &dyn PortProbe) -> Result<u16, ParamedicError> {
    let range = range.normalized();
    info!(
        "paramedic: scanning ports from {} to {}",
        range.start, range.end
    );

    for port in range.start..=range.end {
        match probe.probe(port) {
            Ok(()) => {
                info!("paramedic: port {} is available", port);
                return Ok(port);
            }
            Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
                debug!("Port {} is in use", port);
            }
            Err(source) => return Err(ParamedicError::PortProbe { port, source }),
        }
    }

    Err(ParamedicError::NoPortsAvailable {
        start: range.start,
        end: range.end,
    })
}
