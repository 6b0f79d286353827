//! Call frames

use crate::value::ObjRef;

/// One activation of a closure
#[derive(Debug)]
pub struct CallFrame {
    /// The closure being executed
    pub closure: ObjRef,
    /// Program counter into the closure's chunk
    pub pc: usize,
    /// Stack index of local slot 0 (the receiver, for methods)
    pub base: usize,
    /// Stack index of the callee value; the frame owns everything at or
    /// above this, and return truncates down to it
    pub bottom: usize,
    /// Result count requested by the caller; `None` leaves all results
    /// (internal callers only; bytecode always requests a fixed count)
    pub requested: Option<usize>,
}
