mod access_context;
mod address_context;
mod info;
pub(crate) mod macros;
mod memory_access;
mod vcpu_id;

pub use self::{
    access_context::{AccessContext, Gfn, Pa, TranslationMechanism, Va},
    address_context::AddressContext,
    info::VmiInfo,
    memory_access::MemoryAccess,
    vcpu_id::VcpuId,
};
