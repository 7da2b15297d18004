/// Rolling weak checksum over a fixed-size window
///
/// Two 16-bit accumulators, both wrapping modulo 65536:
/// - A: 1 + sum of all bytes
/// - B: sum of the running values of A
///
/// The final checksum is (B << 16) | A
///
/// Unlike zlib's Adler-32 there is no prime modulus. The arithmetic wraps at
/// 16 bits so that `rotate` and `compute` agree on every window, which is what
/// the signature format relies on.
#[derive(Debug, Clone)]
pub struct RollingChecksum {
    a: u16,
    b: u16,
    window: usize,
}

impl RollingChecksum {
    /// Create a new checksum state for a window of `window` bytes
    pub fn new(window: usize) -> Self {
        Self { a: 1, b: 0, window }
    }

    /// Checksum a block of data (non-rolling)
    pub fn compute(data: &[u8]) -> u32 {
        let mut a: u16 = 1;
        let mut b: u16 = 0;

        for &byte in data {
            a = a.wrapping_add(byte as u16);
            b = b.wrapping_add(a);
        }

        ((b as u32) << 16) | a as u32
    }

    /// Slide a checksum forward by one byte
    ///
    /// O(1): removes `removed` from the left of the window and appends `added`
    /// on the right.
    /// - A_new = A_old - removed + added
    /// - B_new = B_old - window * removed + A_new - 1
    pub fn rotate(checksum: u32, removed: u8, added: u8, window: usize) -> u32 {
        let a = (checksum & 0xffff) as u16;
        let b = (checksum >> 16) as u16;

        let a = a.wrapping_sub(removed as u16).wrapping_add(added as u16);
        let b = (b as u32)
            .wrapping_sub((window as u32).wrapping_mul(removed as u32))
            .wrapping_add(a as u32)
            .wrapping_sub(1) as u16;

        ((b as u32) << 16) | a as u32
    }

    /// Initialize with a full window
    pub fn update_block(&mut self, block: &[u8]) {
        let checksum = Self::compute(block);
        self.a = (checksum & 0xffff) as u16;
        self.b = (checksum >> 16) as u16;
    }

    /// Roll the window: remove old byte, add new byte
    pub fn roll(&mut self, old_byte: u8, new_byte: u8) {
        let checksum = Self::rotate(self.digest(), old_byte, new_byte, self.window);
        self.a = (checksum & 0xffff) as u16;
        self.b = (checksum >> 16) as u16;
    }

    /// Get the current checksum value
    pub fn digest(&self) -> u32 {
        ((self.b as u32) << 16) | self.a as u32
    }
}
