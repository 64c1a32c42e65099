//! XDP deny-list program.
//!
//! Order of checks per packet:
//! 1. TCP/UDP traffic on a failsafe port passes (inbound matches the
//!    destination port, outbound the source port). Non-first IPv4
//!    fragments have no ports and skip this step.
//! 2. The source address is looked up in the family's LPM block table;
//!    a hit drops the packet.
//! 3. Everything else, including anything the parser does not understand,
//!    passes.

#![no_std]
#![no_main]

use core::mem;

use aya_ebpf::{
    bindings::xdp_action,
    macros::{map, xdp},
    maps::{
        lpm_trie::{Key, LpmTrie},
        HashMap,
    },
    programs::XdpContext,
};
use skansen_common::{
    is_later_fragment, FailsafeKey, DIRECTION_INBOUND, DIRECTION_OUTBOUND, PROTO_TCP, PROTO_UDP,
};

const ETH_P_IP: u16 = 0x0800;
const ETH_P_IPV6: u16 = 0x86DD;
const ETH_P_8021Q: u16 = 0x8100;
const ETH_P_8021AD: u16 = 0x88A8;
const ETH_HDR_LEN: usize = 14;
const VLAN_HDR_LEN: usize = 4;
const IPV6_HDR_LEN: usize = 40;

/// Resized by the loader from the configured `max_entries`.
const DEFAULT_MAX_ENTRIES: u32 = 65_536;
const FAILSAFE_MAX_ENTRIES: u32 = 256;

#[repr(C)]
struct Ipv4Hdr {
    vihl: u8,
    _tos: u8,
    _tot_len: u16,
    _id: u16,
    frag_off: u16,
    _ttl: u8,
    proto: u8,
    _check: u16,
    src_addr: [u8; 4],
    _dst_addr: [u8; 4],
}

#[repr(C)]
struct Ipv6Hdr {
    _vtcfl: u32,
    _payload_len: u16,
    next_hdr: u8,
    _hop_limit: u8,
    src_addr: [u8; 16],
    _dst_addr: [u8; 16],
}

/// First four bytes of both TCP and UDP headers.
#[repr(C)]
struct PortsHdr {
    src: [u8; 2],
    dst: [u8; 2],
}

#[map(name = "BLOCK_V4")]
static BLOCK_V4: LpmTrie<[u8; 4], u32> = LpmTrie::pinned(DEFAULT_MAX_ENTRIES, 0);

#[map(name = "BLOCK_V6")]
static BLOCK_V6: LpmTrie<[u8; 16], u32> = LpmTrie::pinned(DEFAULT_MAX_ENTRIES, 0);

#[map(name = "FAILSAFE_PORTS")]
static FAILSAFE_PORTS: HashMap<FailsafeKey, u8> = HashMap::pinned(FAILSAFE_MAX_ENTRIES, 0);

#[xdp]
pub fn skansen_xdp(ctx: XdpContext) -> u32 {
    match try_skansen_xdp(&ctx) {
        Ok(action) => action,
        Err(()) => xdp_action::XDP_PASS,
    }
}

#[inline(always)]
fn ptr_at<T>(ctx: &XdpContext, offset: usize) -> Result<*const T, ()> {
    let start = ctx.data();
    let end = ctx.data_end();
    if start + offset + mem::size_of::<T>() > end {
        return Err(());
    }
    Ok((start + offset) as *const T)
}

#[inline(always)]
fn read_be16(ctx: &XdpContext, offset: usize) -> Result<u16, ()> {
    let raw: *const [u8; 2] = ptr_at(ctx, offset)?;
    Ok(u16::from_be_bytes(unsafe { *raw }))
}

fn try_skansen_xdp(ctx: &XdpContext) -> Result<u32, ()> {
    let mut offset = ETH_HDR_LEN;
    let mut ether_type = read_be16(ctx, ETH_HDR_LEN - 2)?;
    // Up to two stacked tags (QinQ).
    for _ in 0..2 {
        if ether_type != ETH_P_8021Q && ether_type != ETH_P_8021AD {
            break;
        }
        ether_type = read_be16(ctx, offset + 2)?;
        offset += VLAN_HDR_LEN;
    }

    match ether_type {
        ETH_P_IP => {
            let ip: *const Ipv4Hdr = ptr_at(ctx, offset)?;
            let (vihl, proto, src) = unsafe { ((*ip).vihl, (*ip).proto, (*ip).src_addr) };
            let frag_off = read_be16(ctx, offset + mem::offset_of!(Ipv4Hdr, frag_off))?;
            let ihl = ((vihl & 0x0f) as usize) * 4;
            if ihl < mem::size_of::<Ipv4Hdr>() {
                return Ok(xdp_action::XDP_PASS);
            }
            if !is_later_fragment(frag_off) && is_failsafe(ctx, proto, offset + ihl) {
                return Ok(xdp_action::XDP_PASS);
            }
            if BLOCK_V4.get(&Key::new(32, src)).is_some() {
                return Ok(xdp_action::XDP_DROP);
            }
        }
        ETH_P_IPV6 => {
            let ip: *const Ipv6Hdr = ptr_at(ctx, offset)?;
            let (next, src) = unsafe { ((*ip).next_hdr, (*ip).src_addr) };
            // Extension headers are not walked; such packets only see the block check.
            if is_failsafe(ctx, next, offset + IPV6_HDR_LEN) {
                return Ok(xdp_action::XDP_PASS);
            }
            if BLOCK_V6.get(&Key::new(128, src)).is_some() {
                return Ok(xdp_action::XDP_DROP);
            }
        }
        _ => {}
    }
    Ok(xdp_action::XDP_PASS)
}

#[inline(always)]
fn is_failsafe(ctx: &XdpContext, proto: u8, l4_offset: usize) -> bool {
    if proto != PROTO_TCP && proto != PROTO_UDP {
        return false;
    }
    let Ok(ports) = ptr_at::<PortsHdr>(ctx, l4_offset) else {
        return false;
    };
    let (src, dst) = unsafe { (u16::from_be_bytes((*ports).src), u16::from_be_bytes((*ports).dst)) };
    let inbound = FailsafeKey::new(proto, dst, DIRECTION_INBOUND);
    let outbound = FailsafeKey::new(proto, src, DIRECTION_OUTBOUND);
    unsafe { FAILSAFE_PORTS.get(&inbound).is_some() || FAILSAFE_PORTS.get(&outbound).is_some() }
}

#[cfg(not(test))]
#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    loop {}
}
