pub mod batch;
pub mod collaborators;
pub mod direction;
pub mod error;
pub mod executor;
pub mod gateway;
pub mod hypervisor;
pub mod orchestration;

#[cfg(test)]
pub(crate) mod testing;
