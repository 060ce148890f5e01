#![no_std]
#![no_main]

mod maps;
mod skb;
mod sock;

use aya_ebpf::EbpfContext;
use aya_ebpf::macros::classifier;
use aya_ebpf::programs::TcContext;
use aya_log_ebpf::{debug, trace, warn};
use tracectx_common::inject::Injection;
use tracectx_common::sock::SockTrack;
use tracectx_common::{Dispatcher, Outcome, SkbError, TC_ACT_UNSPEC};

use crate::maps::KernelMaps;
use crate::skb::TcSkb;
use crate::sock::KernelSockets;

#[derive(Clone, Copy)]
enum Direction {
    Ingress,
    Egress,
}

impl Direction {
    fn as_str(&self) -> &'static str {
        match self {
            Direction::Ingress => "ingress",
            Direction::Egress => "egress",
        }
    }
}

#[classifier]
pub fn tc_egress(ctx: TcContext) -> i32 {
    process(ctx, Direction::Egress)
}

#[classifier]
pub fn tc_ingress(ctx: TcContext) -> i32 {
    process(ctx, Direction::Ingress)
}

fn process(mut ctx: TcContext, dir: Direction) -> i32 {
    let sockets = KernelSockets::new(ctx.as_ptr());
    let (outcome, tracked) = {
        let mut skb = TcSkb::new(&mut ctx);
        Dispatcher::new(&KernelMaps, &sockets).process_tracked(&mut skb)
    };

    if tracked == Some(SockTrack::Recorded) {
        trace!(&ctx, "{}: socket recorded", dir.as_str());
    }
    log_outcome(&ctx, dir, outcome);

    TC_ACT_UNSPEC
}

fn log_outcome(ctx: &TcContext, dir: Direction, outcome: Outcome) {
    let dir = dir.as_str();
    match outcome {
        Outcome::Recorded => debug!(ctx, "{}: trace context recorded", dir),
        Outcome::Injection(Injection::Injected) => {
            debug!(ctx, "{}: trace context injected", dir)
        }
        Outcome::Injection(Injection::WrittenByL7) => {
            debug!(ctx, "{}: context already written by L7, entry dropped", dir)
        }
        Outcome::Injection(Injection::NotInjectable) => {
            trace!(ctx, "{}: header already carries options, not injecting", dir)
        }
        // The frame may be left grown but only partly rewritten.
        Outcome::Injection(Injection::Failed(SkbError::Helper(code))) => {
            warn!(ctx, "{}: injection failed, helper returned {}, frame may be partly rewritten", dir, code)
        }
        Outcome::Injection(Injection::Failed(_)) => {
            warn!(ctx, "{}: injection failed, no room in packet", dir)
        }
        Outcome::Skipped
        | Outcome::Injection(Injection::NoContext)
        | Outcome::Injection(Injection::Consumed) => {}
    }
}

#[cfg(not(test))]
#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    loop {}
}

#[unsafe(link_section = "license")]
#[unsafe(no_mangle)]
static LICENSE: [u8; 13] = *b"Dual MIT/GPL\0";
