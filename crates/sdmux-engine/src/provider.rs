//! The contract between the multiplexer and a discovery provider.
//!
//! A provider performs the actual protocol work. The engine only needs to be
//! able to start operations, find out which descriptor becomes readable when
//! results are pending, drain those results, and give handles back.

use sdmux_core::{Delivery, NativeHandle, OpId, ProviderError, Request};
use std::os::unix::io::RawFd;

/// A discovery provider.
///
/// Implementations must be callable from any thread, but the engine never
/// uses the same handle from two threads at once.
pub trait Provider: Send + Sync + 'static {
    /// Opens a connection that several operations can be started on.
    fn create_connection(&self) -> Result<NativeHandle, ProviderError>;

    /// Starts an operation.
    ///
    /// `token` must be attached unchanged to every [`Delivery`] produced for
    /// this operation. When `shared` is given, the returned handle is a
    /// subordinate of that connection and its results are drained through it.
    fn start(
        &self,
        token: OpId,
        request: &Request,
        shared: Option<&NativeHandle>,
    ) -> Result<NativeHandle, ProviderError>;

    /// Descriptor that becomes readable when results are pending on `handle`.
    ///
    /// A negative value means the handle has no usable descriptor.
    fn readiness_fd(&self, handle: &NativeHandle) -> RawFd;

    /// Drains every result currently pending on `handle` into `sink`.
    ///
    /// An error means the handle is no longer usable.
    fn process_result(
        &self,
        handle: &NativeHandle,
        sink: &mut dyn FnMut(Delivery),
    ) -> Result<(), ProviderError>;

    /// Gives a handle back to the provider.
    fn release(&self, handle: NativeHandle);
}
