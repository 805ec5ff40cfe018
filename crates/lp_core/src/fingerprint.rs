//! A cheap, constant-space bucket key for allocation call sites.

/// Lossy 32-bit digest of (stack pointer, return address, size class).
///
/// This is deliberately *not* a full stack trace: computing it costs three
/// integer operations, and many unrelated call sites collide into the same
/// bucket, which bounds the cost of light tracking. Only once a fingerprint
/// turns suspicious do we pay for real stack traces.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallstackFingerprint(pub u32);

// Fingerprints are already well mixed; let them key maps directly.
impl nohash_hasher::IsEnabled for CallstackFingerprint {}

impl CallstackFingerprint {
    /// On 64-bit systems the pointer inputs are truncated; that is fine for
    /// a bucket key.
    pub fn compute(stack_pointer: usize, return_address: usize, allocation_size: usize) -> Self {
        // Three regimes: small short-lived objects, medium buffers and large
        // buffers classify separately even with identical call sites. The
        // class constants just need to differ from each other.
        let size_class: u32 = if allocation_size < 100 {
            allocation_size as u32
        } else if allocation_size < 2048 {
            769
        } else {
            49157
        };

        Self(
            ((stack_pointer as u32) << 1)
                ^ (return_address as u32)
                ^ size_class.wrapping_mul(786433),
        )
    }
}

impl std::fmt::Display for CallstackFingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_class_boundaries() {
        let fingerprint = |size| CallstackFingerprint::compute(0, 0, size);

        // Below 100 every size is its own class:
        assert_ne!(fingerprint(1), fingerprint(2));
        assert_ne!(fingerprint(98), fingerprint(99));

        // [100, 2048) is one class, [2048, ∞) another:
        assert_eq!(fingerprint(100), fingerprint(2047));
        assert_eq!(fingerprint(2048), fingerprint(1 << 20));
        assert_ne!(fingerprint(2047), fingerprint(2048));
        assert_ne!(fingerprint(99), fingerprint(100));
    }

    #[test]
    fn mixing_formula() {
        let fingerprint = CallstackFingerprint::compute(0x1000, 0x2000, 50);
        let expected = ((0x1000u32) << 1) ^ 0x2000u32 ^ 50u32.wrapping_mul(786433);
        assert_eq!(fingerprint.0, expected);
    }

    #[test]
    fn identical_inputs_collide() {
        // The whole point: equal inputs always land in the same bucket.
        assert_eq!(
            CallstackFingerprint::compute(0xdead_0000, 0xbeef_0000, 4096),
            CallstackFingerprint::compute(0xdead_0000, 0xbeef_0000, 4096),
        );
    }

    #[test]
    fn pointer_truncation_is_tolerated() {
        // Only the low 32 bits of each pointer participate.
        assert_eq!(
            CallstackFingerprint::compute(0xaaaa_0000_1000, 0xbbbb_0000_2000, 8),
            CallstackFingerprint::compute(0x1000, 0x2000, 8),
        );
    }
}
