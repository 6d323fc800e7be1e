use std::cmp::Ordering;
use std::fmt;

use bytes::{Buf, BufMut};

/// A fixed-width key that can be stored inline in B+ tree pages.
pub trait IndexKey: Copy + fmt::Debug + Send + Sync + 'static {
    /// Number of bytes `encode` writes
    const ENCODED_LEN: usize;

    fn encode(&self, buf: &mut [u8]);

    fn decode(buf: &[u8]) -> Self;

    /// Builds a key from an integer, for loading keys from text.
    fn from_integer(n: i64) -> Self;
}

impl IndexKey for i64 {
    const ENCODED_LEN: usize = 8;

    fn encode(&self, mut buf: &mut [u8]) {
        buf.put_i64_le(*self);
    }

    fn decode(mut buf: &[u8]) -> Self {
        buf.get_i64_le()
    }

    fn from_integer(n: i64) -> Self {
        n
    }
}

impl IndexKey for u32 {
    const ENCODED_LEN: usize = 4;

    fn encode(&self, mut buf: &mut [u8]) {
        buf.put_u32_le(*self);
    }

    fn decode(mut buf: &[u8]) -> Self {
        buf.get_u32_le()
    }

    fn from_integer(n: i64) -> Self {
        n as u32
    }
}

/// Opaque N-byte key, ordered bytewise.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GenericKey<const N: usize>(pub [u8; N]);

impl<const N: usize> GenericKey<N> {
    /// Builds a key from a prefix of `bytes`, zero-padded to N.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut key = [0u8; N];
        let len = bytes.len().min(N);
        key[..len].copy_from_slice(&bytes[..len]);
        Self(key)
    }
}

impl<const N: usize> fmt::Debug for GenericKey<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let end = self.0.iter().rposition(|b| *b != 0).map_or(0, |p| p + 1);
        write!(f, "{:?}", String::from_utf8_lossy(&self.0[..end]))
    }
}

impl<const N: usize> IndexKey for GenericKey<N> {
    const ENCODED_LEN: usize = N;

    fn encode(&self, buf: &mut [u8]) {
        buf[..N].copy_from_slice(&self.0);
    }

    fn decode(buf: &[u8]) -> Self {
        Self::from_bytes(&buf[..N])
    }

    /// Big-endian, so integer order matches byte order for non-negative
    /// keys. Narrow keys keep the low bytes.
    fn from_integer(n: i64) -> Self {
        let bytes = n.to_be_bytes();
        Self::from_bytes(&bytes[bytes.len().saturating_sub(N)..])
    }
}

/// Orders keys inside the tree.
pub trait KeyComparator<K>: Send + Sync {
    fn compare(&self, a: &K, b: &K) -> Ordering;
}

/// Uses the key's own `Ord`.
#[derive(Debug, Clone, Copy, Default)]
pub struct OrdComparator;

impl<K: Ord> KeyComparator<K> for OrdComparator {
    fn compare(&self, a: &K, b: &K) -> Ordering {
        a.cmp(b)
    }
}

impl<K, F> KeyComparator<K> for F
where
    F: Fn(&K, &K) -> Ordering + Send + Sync,
{
    fn compare(&self, a: &K, b: &K) -> Ordering {
        self(a, b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generic_key_orders_bytewise() {
        let a = GenericKey::<8>::from_bytes(b"apple");
        let b = GenericKey::<8>::from_bytes(b"banana");
        assert_eq!(OrdComparator.compare(&a, &b), Ordering::Less);

        let mut buf = [0u8; 8];
        b.encode(&mut buf);
        assert_eq!(GenericKey::<8>::decode(&buf), b);
        assert_eq!(format!("{:?}", a), "\"apple\"");
    }

    #[test]
    fn test_keys_from_integers() {
        assert_eq!(i64::from_integer(-4), -4);
        assert_eq!(u32::from_integer(9), 9);

        let small = GenericKey::<16>::from_integer(2);
        let large = GenericKey::<16>::from_integer(300);
        assert_eq!(OrdComparator.compare(&small, &large), Ordering::Less);
        assert_eq!(GenericKey::<2>::from_integer(0x0102).0, [1, 2]);
    }

    #[test]
    fn test_closure_comparator() {
        let reverse = |a: &i64, b: &i64| b.cmp(a);
        assert_eq!(reverse.compare(&1, &2), Ordering::Greater);
    }
}
