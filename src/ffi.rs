#![allow(dead_code)] // Label symbols are only used for their addresses

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
extern "C" {
    /// Copies `len` bytes from `src` to `dst` with `rep movsb`.
    /// Returns 1 on success, 0 if the copy faulted and was recovered.
    pub fn apf_probe_copy(dst: *mut u8, src: *const u8, len: usize) -> u32;

    /// First byte after the faultable part of `apf_probe_copy`.
    /// Never call it; the address bounds the range the fault handler recovers.
    pub fn apf_probe_copy_end();

    /// Landing pad the fault handler moves RIP to. Returns 0.
    pub fn apf_probe_recover() -> u32;
}
