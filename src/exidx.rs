//! ARM exception-index table queries for the unwinder.

use crate::arch::EXIDX_ENTRY_SIZE;
use crate::error::{Result, unknown_handle_error};
use crate::kernel::Kernel;
use crate::module::Handle;
use crate::Rtld;

impl<K: Kernel> Rtld<K> {
    /// Exception-index table covering `pc`: `(table address, entry
    /// count)`.
    ///
    /// Scans the loaded modules and falls back to the host program's own
    /// table when none of them contains the address; `(0, 0)` means there
    /// is nothing to unwind with. The language runtime's unwinder reaches
    /// this through the embedder's `__gnu_Unwind_Find_exidx` shim.
    pub fn find_exidx(&self, pc: usize) -> (usize, u32) {
        for dso in self.modules.iter().skip(1) {
            if dso.contains(pc) && dso.exidx != 0 {
                return (dso.exidx, dso.num_exidx);
            }
        }
        match &self.host_exidx {
            Some(range) => (
                range.start,
                ((range.end - range.start) / EXIDX_ENTRY_SIZE) as u32,
            ),
            None => (0, 0),
        }
    }

    /// Exception-index table of one module: `(table address, entry
    /// count)`, `(0, 0)` when the image carries none.
    pub fn get_exidx(&mut self, handle: Handle) -> Result<(usize, u32)> {
        if let Some(idx) = self.find_module(handle) {
            let dso = &self.modules[idx];
            return Ok((dso.exidx, dso.num_exidx));
        }
        Err(self.set_error(unknown_handle_error("get_exidx(): unknown module handle")))
    }
}
