//! Minimal view of a packet as the XDP hook sees it.

use std::net::IpAddr;

use crate::failsafe::{Direction, Protocol};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transport {
    Tcp { src_port: u16, dst_port: u16 },
    Udp { src_port: u16, dst_port: u16 },
    Icmp,
    Other(u8),
}

impl Transport {
    pub fn protocol(&self) -> Option<Protocol> {
        match self {
            Transport::Tcp { .. } => Some(Protocol::Tcp),
            Transport::Udp { .. } => Some(Protocol::Udp),
            _ => None,
        }
    }

    /// Port a failsafe rule of `direction` is matched against.
    pub fn port_for(&self, direction: Direction) -> Option<u16> {
        let (src_port, dst_port) = match *self {
            Transport::Tcp { src_port, dst_port } | Transport::Udp { src_port, dst_port } => {
                (src_port, dst_port)
            }
            _ => return None,
        };
        Some(match direction {
            Direction::Inbound => dst_port,
            Direction::Outbound => src_port,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PacketMeta {
    pub src: IpAddr,
    pub dst: IpAddr,
    pub transport: Transport,
}

impl PacketMeta {
    pub fn tcp(src: IpAddr, dst: IpAddr, src_port: u16, dst_port: u16) -> Self {
        Self {
            src,
            dst,
            transport: Transport::Tcp { src_port, dst_port },
        }
    }

    pub fn udp(src: IpAddr, dst: IpAddr, src_port: u16, dst_port: u16) -> Self {
        Self {
            src,
            dst,
            transport: Transport::Udp { src_port, dst_port },
        }
    }

    pub fn icmp(src: IpAddr, dst: IpAddr) -> Self {
        Self {
            src,
            dst,
            transport: Transport::Icmp,
        }
    }
}
