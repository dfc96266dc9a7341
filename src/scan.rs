// scan.rs -- Exclusive prefix sum over 32-bit flags.
//
// The compaction pass turns a per-slot decision array into output
// positions with an exclusive scan. On the device the decision array is
// read back, scanned here, and the prefix array re-uploaded; the CPU
// pipeline calls this directly.

/// Exclusive prefix sum of `input` into `output`.
///
/// `output[i]` is the sum of `input[0..i]`; `output[0]` is 0. Returns the
/// total sum, i.e. the number of set flags when the input is 0/1.
///
/// # Panics
/// Panics if the slices differ in length.
pub fn exclusive_prefix_sum(input: &[u32], output: &mut [u32]) -> u32 {
    assert_eq!(input.len(), output.len(), "scan buffers differ in length");
    let mut running = 0u32;
    for (dst, &v) in output.iter_mut().zip(input.iter()) {
        *dst = running;
        running += v;
    }
    running
}
