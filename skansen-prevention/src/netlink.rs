//! rtnetlink client for the two link operations aya does not cover:
//! reading which XDP program is attached to a link, and clearing it.

use std::ffi::CString;
use std::io::{Error, ErrorKind, Result};

use netlink_packet_core::{
    NetlinkHeader, NetlinkMessage, NetlinkPayload, NLM_F_ACK, NLM_F_REQUEST,
};
use netlink_packet_route::link::{LinkAttribute, LinkMessage, LinkXdp, XdpAttached};
use netlink_packet_route::RouteNetlinkMessage;
use netlink_sys::{protocols::NETLINK_ROUTE, Socket, SocketAddr};

pub const XDP_FLAGS_SKB_MODE: u32 = 1 << 1;
pub const XDP_FLAGS_DRV_MODE: u32 = 1 << 2;
pub const XDP_FLAGS_HW_MODE: u32 = 1 << 3;

const RECV_BUFFER_LEN: usize = 32 * 1024;

/// XDP attachment reported for a link.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct XdpAttachment {
    pub program_id: u32,
    /// Flag matching the attach mode, needed to clear it again.
    pub mode_flags: u32,
}

pub fn if_index(name: &str) -> Result<u32> {
    let c_name = CString::new(name).map_err(|_| Error::new(ErrorKind::InvalidInput, "nul in name"))?;
    // SAFETY: c_name is a valid NUL-terminated string for the duration of the call.
    let index = unsafe { libc::if_nametoindex(c_name.as_ptr()) };
    if index == 0 {
        return Err(Error::last_os_error());
    }
    Ok(index)
}

/// Program attached to `ifindex`, if any.
pub fn xdp_attachment(ifindex: u32) -> Result<Option<XdpAttachment>> {
    let mut socket = RouteSocket::open()?;
    let seq = socket.next_seq();
    let replies = socket.request(get_link_request(ifindex, seq))?;
    Ok(replies
        .iter()
        .find_map(|msg| match msg {
            RouteNetlinkMessage::NewLink(link) if link.header.index == ifindex => Some(link),
            _ => None,
        })
        .and_then(attachment_of))
}

/// Detaches whatever program is attached in the mode given by `mode_flags`.
pub fn clear_xdp(ifindex: u32, mode_flags: u32) -> Result<()> {
    let mut socket = RouteSocket::open()?;
    let seq = socket.next_seq();
    socket.request(clear_xdp_request(ifindex, mode_flags, seq)).map(|_| ())
}

fn get_link_request(ifindex: u32, seq: u32) -> NetlinkMessage<RouteNetlinkMessage> {
    let mut link = LinkMessage::default();
    link.header.index = ifindex;
    route_request(RouteNetlinkMessage::GetLink(link), NLM_F_REQUEST, seq)
}

fn clear_xdp_request(ifindex: u32, mode_flags: u32, seq: u32) -> NetlinkMessage<RouteNetlinkMessage> {
    let mut xdp = vec![LinkXdp::Fd(-1)];
    if mode_flags != 0 {
        xdp.push(LinkXdp::Flags(mode_flags));
    }
    let mut link = LinkMessage::default();
    link.header.index = ifindex;
    link.attributes.push(LinkAttribute::Xdp(xdp));
    route_request(RouteNetlinkMessage::SetLink(link), NLM_F_REQUEST | NLM_F_ACK, seq)
}

fn route_request(
    payload: RouteNetlinkMessage,
    flags: u16,
    seq: u32,
) -> NetlinkMessage<RouteNetlinkMessage> {
    let mut header = NetlinkHeader::default();
    header.flags = flags;
    header.sequence_number = seq;
    let mut msg = NetlinkMessage::new(header, NetlinkPayload::from(payload));
    msg.finalize();
    msg
}

fn attachment_of(link: &LinkMessage) -> Option<XdpAttachment> {
    let xdp = link.attributes.iter().find_map(|attr| match attr {
        LinkAttribute::Xdp(xdp) => Some(xdp),
        _ => None,
    })?;

    let mut attached = &XdpAttached::None;
    let mut program_id = 0u32;
    for attr in xdp {
        match attr {
            LinkXdp::Attached(mode) => attached = mode,
            LinkXdp::ProgId(id) => program_id = *id,
            _ => {}
        }
    }
    let mode_flags = match attached {
        XdpAttached::None => return None,
        XdpAttached::Driver => XDP_FLAGS_DRV_MODE,
        XdpAttached::SocketBuffer => XDP_FLAGS_SKB_MODE,
        XdpAttached::Hardware => XDP_FLAGS_HW_MODE,
        _ => 0,
    };
    (program_id != 0).then_some(XdpAttachment {
        program_id,
        mode_flags,
    })
}

struct RouteSocket {
    socket: Socket,
    seq: u32,
}

impl RouteSocket {
    fn open() -> Result<Self> {
        let mut socket = Socket::new(NETLINK_ROUTE)?;
        socket.bind_auto()?;
        socket.connect(&SocketAddr::new(0, 0))?;
        Ok(Self { socket, seq: 0 })
    }

    fn next_seq(&mut self) -> u32 {
        self.seq = self.seq.wrapping_add(1);
        self.seq
    }

    /// Sends `msg` and collects the replies carrying its sequence number until
    /// the ack, `NLMSG_DONE`, or the first datagram of a plain request.
    fn request(&self, msg: NetlinkMessage<RouteNetlinkMessage>) -> Result<Vec<RouteNetlinkMessage>> {
        let wants_ack = msg.header.flags & NLM_F_ACK != 0;
        let seq = msg.header.sequence_number;
        let mut buf = vec![0u8; msg.buffer_len()];
        msg.serialize(&mut buf);
        self.socket.send(&buf, 0)?;

        let mut replies = Vec::new();
        let mut recv_buf = Vec::with_capacity(RECV_BUFFER_LEN);
        loop {
            recv_buf.clear();
            let received = self.socket.recv(&mut recv_buf, 0)?;
            let mut offset = 0;
            while offset < received {
                let reply = NetlinkMessage::<RouteNetlinkMessage>::deserialize(&recv_buf[offset..received])
                    .map_err(|e| Error::new(ErrorKind::InvalidData, format!("{e:?}")))?;
                let len = reply.header.length as usize;
                if len == 0 {
                    break;
                }
                offset += len;
                if reply.header.sequence_number != seq {
                    continue;
                }
                match reply.payload {
                    NetlinkPayload::Error(err) => {
                        return match err.code {
                            Some(code) => Err(Error::from_raw_os_error(-code.get())),
                            None => Ok(replies),
                        };
                    }
                    NetlinkPayload::Done(_) => return Ok(replies),
                    NetlinkPayload::InnerMessage(inner) => replies.push(inner),
                    _ => {}
                }
            }
            if !wants_ack && !replies.is_empty() {
                return Ok(replies);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn link_with(attrs: Vec<LinkAttribute>) -> LinkMessage {
        let mut link = LinkMessage::default();
        link.header.index = 3;
        link.attributes = attrs;
        link
    }

    #[test]
    fn skb_attachment_is_reported_with_its_program() {
        let link = link_with(vec![
            LinkAttribute::IfName("eth0".into()),
            LinkAttribute::Xdp(vec![LinkXdp::Attached(XdpAttached::SocketBuffer), LinkXdp::ProgId(42)]),
        ]);
        assert_eq!(
            attachment_of(&link),
            Some(XdpAttachment {
                program_id: 42,
                mode_flags: XDP_FLAGS_SKB_MODE
            })
        );
    }

    #[test]
    fn nothing_attached() {
        let detached = link_with(vec![LinkAttribute::Xdp(vec![LinkXdp::Attached(XdpAttached::None)])]);
        assert_eq!(attachment_of(&detached), None);
        assert_eq!(attachment_of(&link_with(Vec::new())), None);
    }

    #[test]
    fn clear_request_carries_fd_and_mode() {
        let msg = clear_xdp_request(3, XDP_FLAGS_DRV_MODE, 7);
        assert_eq!(msg.header.sequence_number, 7);
        assert_eq!(msg.header.flags, NLM_F_REQUEST | NLM_F_ACK);

        let mut buf = vec![0u8; msg.buffer_len()];
        msg.serialize(&mut buf);
        let parsed = NetlinkMessage::<RouteNetlinkMessage>::deserialize(&buf).unwrap();
        let NetlinkPayload::InnerMessage(RouteNetlinkMessage::SetLink(link)) = parsed.payload else {
            panic!("expected RTM_SETLINK");
        };
        assert_eq!(link.header.index, 3);
        assert_eq!(
            link.attributes,
            vec![LinkAttribute::Xdp(vec![LinkXdp::Fd(-1), LinkXdp::Flags(XDP_FLAGS_DRV_MODE)])]
        );
    }

    #[test]
    fn get_link_request_targets_one_link() {
        let msg = get_link_request(9, 1);
        assert_eq!(msg.header.flags, NLM_F_REQUEST);
        let NetlinkPayload::InnerMessage(RouteNetlinkMessage::GetLink(link)) = &msg.payload else {
            panic!("expected RTM_GETLINK");
        };
        assert_eq!(link.header.index, 9);
        assert!(link.attributes.is_empty());
    }
}
