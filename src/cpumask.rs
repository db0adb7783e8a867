// IOCORE CPU MASK
// FIXED-SIZE BITMAP. NO HEAP. COPY-CHEAP SO POOLS, WORKERS AND BACKING
// DEVICES CAN HOLD THEIR OWN MASKS WITHOUT SHARING.

use std::fmt;

use crate::error::{Error, Result};

pub const MAX_CPUS: usize = 256;
const WORDS: usize = MAX_CPUS / 64;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct CpuMask {
    bits: [u64; WORDS],
}

impl CpuMask {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_cpus<I: IntoIterator<Item = usize>>(cpus: I) -> Self {
        let mut mask = Self::new();
        for cpu in cpus {
            mask.set(cpu);
        }
        mask
    }

    pub fn single(cpu: usize) -> Self {
        Self::from_cpus([cpu])
    }

    pub fn set(&mut self, cpu: usize) {
        if cpu < MAX_CPUS {
            self.bits[cpu / 64] |= 1u64 << (cpu % 64);
        }
    }

    pub fn clear(&mut self, cpu: usize) {
        if cpu < MAX_CPUS {
            self.bits[cpu / 64] &= !(1u64 << (cpu % 64));
        }
    }

    pub fn test(&self, cpu: usize) -> bool {
        cpu < MAX_CPUS && self.bits[cpu / 64] & (1u64 << (cpu % 64)) != 0
    }

    pub fn weight(&self) -> usize {
        self.bits.iter().map(|w| w.count_ones() as usize).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.bits.iter().all(|&w| w == 0)
    }

    pub fn union(&self, other: &CpuMask) -> CpuMask {
        let mut out = *self;
        for i in 0..WORDS {
            out.bits[i] |= other.bits[i];
        }
        out
    }

    pub fn intersection(&self, other: &CpuMask) -> CpuMask {
        let mut out = *self;
        for i in 0..WORDS {
            out.bits[i] &= other.bits[i];
        }
        out
    }

    pub fn difference(&self, other: &CpuMask) -> CpuMask {
        let mut out = *self;
        for i in 0..WORDS {
            out.bits[i] &= !other.bits[i];
        }
        out
    }

    pub fn is_subset(&self, other: &CpuMask) -> bool {
        (0..WORDS).all(|i| self.bits[i] & !other.bits[i] == 0)
    }

    pub fn first(&self) -> Option<usize> {
        self.iter().next()
    }

    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        (0..MAX_CPUS).filter(move |&cpu| self.test(cpu))
    }

    pub fn to_vec(&self) -> Vec<usize> {
        self.iter().collect()
    }

    // RAW WORDS FOR cpu_set_t CONVERSION IN THE SYSFS BACKEND
    // KERNEL LIST FORMAT: "0-3,8,10-11"
    pub fn to_list_string(&self) -> String {
        let cpus = self.to_vec();
        let mut parts: Vec<String> = Vec::new();
        let mut i = 0;
        while i < cpus.len() {
            let start = cpus[i];
            let mut end = start;
            while i + 1 < cpus.len() && cpus[i + 1] == end + 1 {
                i += 1;
                end = cpus[i];
            }
            if start == end {
                parts.push(start.to_string());
            } else {
                parts.push(format!("{}-{}", start, end));
            }
            i += 1;
        }
        parts.join(",")
    }

    pub fn parse_list(s: &str) -> Result<CpuMask> {
        let mut mask = CpuMask::new();
        for part in s.trim().split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let bad = || Error::Config(format!("bad cpu list element '{}'", part));
            match part.split_once('-') {
                Some((lo, hi)) => {
                    let lo: usize = lo.trim().parse().map_err(|_| bad())?;
                    let hi: usize = hi.trim().parse().map_err(|_| bad())?;
                    if lo > hi || hi >= MAX_CPUS {
                        return Err(bad());
                    }
                    for cpu in lo..=hi {
                        mask.set(cpu);
                    }
                }
                None => {
                    let cpu: usize = part.parse().map_err(|_| bad())?;
                    if cpu >= MAX_CPUS {
                        return Err(bad());
                    }
                    mask.set(cpu);
                }
            }
        }
        Ok(mask)
    }
}

impl fmt::Debug for CpuMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CpuMask[{}]", self.to_list_string())
    }
}

impl fmt::Display for CpuMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            write!(f, "-")
        } else {
            write!(f, "{}", self.to_list_string())
        }
    }
}

impl FromIterator<usize> for CpuMask {
    fn from_iter<I: IntoIterator<Item = usize>>(iter: I) -> Self {
        CpuMask::from_cpus(iter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_clear_weight() {
        let mut m = CpuMask::new();
        m.set(0);
        m.set(65);
        m.set(200);
        assert_eq!(m.weight(), 3);
        assert!(m.test(65));
        m.clear(65);
        assert!(!m.test(65));
        assert_eq!(m.to_vec(), vec![0, 200]);
    }

    #[test]
    fn list_format() {
        let m = CpuMask::from_cpus([0, 1, 2, 3, 8, 10, 11]);
        assert_eq!(m.to_list_string(), "0-3,8,10-11");
        assert_eq!(CpuMask::parse_list("0-3,8,10-11").unwrap(), m);
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(CpuMask::parse_list("3-1").is_err());
        assert!(CpuMask::parse_list("x").is_err());
        assert!(CpuMask::parse_list("999").is_err());
        assert!(CpuMask::parse_list("").unwrap().is_empty());
    }

    #[test]
    fn subset_and_difference() {
        let a = CpuMask::from_cpus([1, 2]);
        let b = CpuMask::from_cpus([1, 2, 3]);
        assert!(a.is_subset(&b));
        assert!(!b.is_subset(&a));
        assert_eq!(b.difference(&a), CpuMask::single(3));
        assert_eq!(a.intersection(&b), a);
    }
}
