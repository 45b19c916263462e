//! Arithmetic in the Mersenne prime field GF(2^127 - 1)
//!
//! Position tags and audit values are elements of this field. Elements are
//! encoded as 16 little-endian bytes and are always kept canonical (< p).

use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign, Mul, Neg, Sub};

use rand::RngCore;

const MODULUS: u128 = (1u128 << 127) - 1;

/// Element of GF(2^127 - 1)
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Fp(u128);

impl Fp {
    pub const ZERO: Fp = Fp(0);
    pub const ONE: Fp = Fp(1);
    pub const MODULUS: u128 = MODULUS;

    /// Encoded size in bytes
    pub const BYTES: usize = 16;

    /// Reduce an arbitrary 128-bit value into the field
    pub fn new(value: u128) -> Self {
        Fp(reduce(value))
    }

    pub fn value(self) -> u128 {
        self.0
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// Decode a canonical element; rejects encodings >= p
    pub fn from_bytes(bytes: &[u8; 16]) -> Option<Self> {
        let value = u128::from_le_bytes(*bytes);
        (value < MODULUS).then_some(Fp(value))
    }

    /// Map 16 uniformly random bytes onto the field
    ///
    /// The top bit is cleared, leaving a single non-canonical value (p itself)
    /// that folds onto zero.
    pub fn from_uniform_bytes(bytes: &[u8; 16]) -> Self {
        Fp::new(u128::from_le_bytes(*bytes) & MODULUS)
    }

    pub fn to_bytes(self) -> [u8; 16] {
        self.0.to_le_bytes()
    }

    pub fn random<R: RngCore + ?Sized>(rng: &mut R) -> Self {
        let mut bytes = [0u8; 16];
        rng.fill_bytes(&mut bytes);
        Fp::from_uniform_bytes(&bytes)
    }

    /// Random element that is guaranteed nonzero
    pub fn random_nonzero<R: RngCore + ?Sized>(rng: &mut R) -> Self {
        loop {
            let candidate = Fp::random(rng);
            if !candidate.is_zero() {
                return candidate;
            }
        }
    }

    pub fn square(self) -> Self {
        self * self
    }

    pub fn double(self) -> Self {
        self + self
    }
}

/// Fold a 128-bit value using 2^127 = 1 (mod p)
#[inline]
fn reduce(x: u128) -> u128 {
    let r = (x & MODULUS) + (x >> 127);
    if r >= MODULUS {
        r - MODULUS
    } else {
        r
    }
}

impl Add for Fp {
    type Output = Fp;

    fn add(self, rhs: Fp) -> Fp {
        // both operands < 2^127, so the sum fits in u128
        Fp(reduce(self.0 + rhs.0))
    }
}

impl AddAssign for Fp {
    fn add_assign(&mut self, rhs: Fp) {
        *self = *self + rhs;
    }
}

impl Neg for Fp {
    type Output = Fp;

    fn neg(self) -> Fp {
        if self.0 == 0 {
            self
        } else {
            Fp(MODULUS - self.0)
        }
    }
}

impl Sub for Fp {
    type Output = Fp;

    fn sub(self, rhs: Fp) -> Fp {
        self + (-rhs)
    }
}

impl Mul for Fp {
    type Output = Fp;

    fn mul(self, rhs: Fp) -> Fp {
        let (a0, a1) = (self.0 & u64::MAX as u128, self.0 >> 64);
        let (b0, b1) = (rhs.0 & u64::MAX as u128, rhs.0 >> 64);

        // a1, b1 < 2^63, so every partial product and `mid` fit in u128
        let lo = a0 * b0;
        let mid = a0 * b1 + a1 * b0;
        let hi = a1 * b1;

        let (low, carry) = lo.overflowing_add(mid << 64);
        let high = hi + (mid >> 64) + carry as u128;

        // product = high * 2^128 + low, and 2^128 = 2 (mod p)
        Fp(reduce(low)) + Fp(reduce(high << 1))
    }
}

impl Sum for Fp {
    fn sum<I: Iterator<Item = Fp>>(iter: I) -> Fp {
        iter.fold(Fp::ZERO, |acc, x| acc + x)
    }
}

impl From<u64> for Fp {
    fn from(value: u64) -> Self {
        Fp(value as u128)
    }
}

impl fmt::Debug for Fp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fp({:#x})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_reduce_wraps_modulus() {
        assert_eq!(Fp::new(MODULUS), Fp::ZERO);
        assert_eq!(Fp::new(MODULUS + 5), Fp::from(5));
        assert_eq!(Fp::new(u128::MAX), Fp::from(1));
    }

    #[test]
    fn test_minus_one_squared() {
        let minus_one = -Fp::ONE;
        assert_eq!(minus_one.value(), MODULUS - 1);
        assert_eq!(minus_one * minus_one, Fp::ONE);
    }

    #[test]
    fn test_mul_matches_small_integers() {
        let a = Fp::from(u64::MAX);
        let b = Fp::from(3);
        assert_eq!((a * b).value(), (u64::MAX as u128) * 3);
    }

    #[test]
    fn test_two_pow_127_is_one() {
        let two_64 = Fp::new(1u128 << 64);
        let two_63 = Fp::new(1u128 << 63);
        assert_eq!(two_64 * two_63, Fp::ONE);
    }

    #[test]
    fn test_field_laws_on_random_elements() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..200 {
            let a = Fp::random(&mut rng);
            let b = Fp::random(&mut rng);
            let c = Fp::random(&mut rng);
            assert_eq!(a * (b + c), a * b + a * c);
            assert_eq!((a * b) * c, a * (b * c));
            assert_eq!(a - b + b, a);
            assert_eq!(a + (-a), Fp::ZERO);
            assert_eq!((a + b).square(), a.square() + (a * b).double() + b.square());
        }
    }

    #[test]
    fn test_non_canonical_bytes_rejected() {
        assert!(Fp::from_bytes(&MODULUS.to_le_bytes()).is_none());
        assert!(Fp::from_bytes(&u128::MAX.to_le_bytes()).is_none());
        let x = Fp::from(42);
        assert_eq!(Fp::from_bytes(&x.to_bytes()), Some(x));
    }
}
