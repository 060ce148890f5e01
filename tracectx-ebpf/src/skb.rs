use aya_ebpf::EbpfContext;
use aya_ebpf::cty::c_void;
use aya_ebpf::helpers::bpf_skb_store_bytes;
use aya_ebpf::programs::TcContext;
use tracectx_common::{SkBuff, SkbError};

const BPF_ADJ_ROOM_NET: u32 = 0;
// Leave checksum_complete alone; the header checksum is patched by hand.
const BPF_F_ADJ_ROOM_NO_CSUM_RESET: u64 = 1 << 5;

/// The packet behind a tc hook invocation.
pub struct TcSkb<'a> {
    ctx: &'a mut TcContext,
}

impl<'a> TcSkb<'a> {
    pub fn new(ctx: &'a mut TcContext) -> Self {
        Self { ctx }
    }
}

impl SkBuff for TcSkb<'_> {
    fn len(&self) -> usize {
        self.ctx.len() as usize
    }

    #[inline(always)]
    fn load_bytes(&self, offset: usize, dst: &mut [u8]) -> Result<(), SkbError> {
        let len = dst.len();
        self.ctx
            .load_bytes(offset, dst)
            .map(|_| ())
            .map_err(|_| SkbError::OutOfBounds { offset, len })
    }

    #[inline(always)]
    fn store_bytes(&mut self, offset: usize, src: &[u8]) -> Result<(), SkbError> {
        let ret = unsafe {
            bpf_skb_store_bytes(
                self.ctx.as_ptr() as *mut _,
                offset as u32,
                src.as_ptr() as *const c_void,
                src.len() as u32,
                0,
            )
        };
        if ret < 0 {
            return Err(SkbError::Helper(ret as i64));
        }
        Ok(())
    }

    fn grow_net(&mut self, len: u32) -> Result<(), SkbError> {
        self.ctx
            .adjust_room(len as i32, BPF_ADJ_ROOM_NET, BPF_F_ADJ_ROOM_NO_CSUM_RESET)
            .map_err(|_| SkbError::NoRoom)
    }
}
