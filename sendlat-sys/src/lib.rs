//! Raw bindings to `libibverbs` and `librdmacm`, generated from the system rdma-core headers.
//!
//! When the headers are not installed the crate is empty; see `build.rs`.

#![allow(non_upper_case_globals)]
#![allow(non_camel_case_types)]
#![allow(non_snake_case)]
#![allow(missing_docs)]

include!(concat!(env!("OUT_DIR"), "/bindings.rs"));

#[cfg(has_rdma_core)]
pub use wc::ibv_wc;

#[cfg(has_rdma_core)]
mod wc {
    use super::{ibv_wc_flags, ibv_wc_opcode, ibv_wc_status};

    /// A work completion as returned by `ibv_poll_cq`.
    ///
    /// bindgen emits the anonymous `imm_data`/`invalidated_rkey` union in a way that does not
    /// round-trip through `Default`, so the struct is spelled out by hand.
    #[repr(C)]
    #[derive(Debug, Copy, Clone)]
    pub struct ibv_wc {
        wr_id: u64,
        status: ibv_wc_status::Type,
        opcode: ibv_wc_opcode::Type,
        vendor_err: u32,
        byte_len: u32,
        /// Immediate data or the invalidated rkey, depending on `wc_flags`.
        pub imm_data: u32,
        /// Local QP number of the completed work request.
        pub qp_num: u32,
        /// Remote QP number; valid for receive completions on UD QPs.
        pub src_qp: u32,
        pub wc_flags: ibv_wc_flags,
        pub pkey_index: u16,
        pub slid: u16,
        pub sl: u8,
        pub dlid_path_bits: u8,
    }

    impl ibv_wc {
        /// The value that was associated with the corresponding work request.
        pub fn wr_id(&self) -> u64 {
            self.wr_id
        }

        /// Number of bytes transferred. For UD receives this includes the 40 bytes reserved for
        /// the GRH, whether or not one was present.
        pub fn len(&self) -> usize {
            self.byte_len as usize
        }

        /// Raw completion status.
        pub fn status(&self) -> ibv_wc_status::Type {
            self.status
        }

        /// Vendor error syndrome; only meaningful when the status is not `IBV_WC_SUCCESS`.
        pub fn vendor_err(&self) -> u32 {
            self.vendor_err
        }

        /// The operation that the corresponding work request performed.
        pub fn opcode(&self) -> ibv_wc_opcode::Type {
            self.opcode
        }
    }

    impl Default for ibv_wc {
        fn default() -> Self {
            ibv_wc {
                wr_id: 0,
                status: ibv_wc_status::IBV_WC_GENERAL_ERR,
                opcode: ibv_wc_opcode::IBV_WC_LOCAL_INV,
                vendor_err: 0,
                byte_len: 0,
                imm_data: 0,
                qp_num: 0,
                src_qp: 0,
                wc_flags: ibv_wc_flags(0),
                pkey_index: 0,
                slid: 0,
                sl: 0,
                dlid_path_bits: 0,
            }
        }
    }

    #[test]
    fn ibv_wc_layout() {
        use std::mem::{align_of, offset_of, size_of};

        assert_eq!(size_of::<ibv_wc>(), 48);
        assert_eq!(align_of::<ibv_wc>(), 8);
        assert_eq!(offset_of!(ibv_wc, status), 8);
        assert_eq!(offset_of!(ibv_wc, byte_len), 20);
        assert_eq!(offset_of!(ibv_wc, qp_num), 28);
        assert_eq!(offset_of!(ibv_wc, wc_flags), 36);
        assert_eq!(offset_of!(ibv_wc, slid), 42);
        assert_eq!(offset_of!(ibv_wc, dlid_path_bits), 45);
    }
}
