//! Wire format of leak requests.
//!
//! One request is one datagram; every field is a 4-byte integer in the
//! host's native byte order. The reply is always the received bytes.

use std::fmt;

/// Bit offset into the secret store (or into a system register, for the
/// register-leak variant).
///
/// Values past the architectural bound are valid requests: that is how the
/// mispredicted path gets exercised. Negative values compare as huge unsigned
/// values against the bound and are never in bounds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BitIndex(pub i32);
impl BitIndex {
    /// The index as compared against the bound.
    #[inline(always)]
    pub fn unsigned(self) -> usize { self.0 as isize as usize }
}

/// An `MRS Xt, <sysreg>` encoding naming the system register that the
/// register-leak gadget reads.
///
/// The destination register field is always rewritten to
/// [`RegisterSelector::GADGET_RT`], since the rest of the gadget consumes
/// the value from that register.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct RegisterSelector(u32);
impl RegisterSelector {
    const MRS_MASK: u32  = 0xfff0_0000;
    const MRS_MATCH: u32 = 0xd530_0000;
    const RT_MASK: u32   = 0x0000_001f;

    /// Register the gadget expects the system register value in (`x9`).
    pub const GADGET_RT: u32 = 9;

    pub const TTBR0_EL1: Self = Self::from_sysreg(3, 0, 2, 0, 0);
    pub const TTBR1_EL1: Self = Self::from_sysreg(3, 0, 2, 0, 1);
    pub const TCR_EL1: Self   = Self::from_sysreg(3, 0, 2, 0, 2);
    pub const SCTLR_EL1: Self = Self::from_sysreg(3, 0, 1, 0, 0);
    pub const VBAR_EL1: Self  = Self::from_sysreg(3, 0, 12, 0, 0);
    pub const MAIR_EL1: Self  = Self::from_sysreg(3, 0, 10, 2, 0);

    /// Named selectors, for the request client.
    pub const NAMED: &'static [(&'static str, RegisterSelector)] = &[
        ("ttbr0_el1", Self::TTBR0_EL1),
        ("ttbr1_el1", Self::TTBR1_EL1),
        ("tcr_el1",   Self::TCR_EL1),
        ("sctlr_el1", Self::SCTLR_EL1),
        ("vbar_el1",  Self::VBAR_EL1),
        ("mair_el1",  Self::MAIR_EL1),
    ];

    /// Build the encoding for `MRS x9, S<op0>_<op1>_C<crn>_C<crm>_<op2>`.
    pub const fn from_sysreg(op0: u32, op1: u32, crn: u32, crm: u32, op2: u32)
        -> Self
    {
        assert!(op0 >= 2 && op0 <= 3);
        let o0 = op0 & 1;
        Self(Self::MRS_MATCH
            | (o0 << 19) | ((op1 & 7) << 16) | ((crn & 0xf) << 12)
            | ((crm & 0xf) << 8) | ((op2 & 7) << 5)
            | Self::GADGET_RT)
    }

    /// Validate a raw encoding from a request. Returns `None` when `raw` is
    /// not a system register read.
    pub fn from_raw(raw: u32) -> Option<Self> {
        if raw & Self::MRS_MASK != Self::MRS_MATCH {
            return None;
        }
        Some(Self((raw & !Self::RT_MASK) | Self::GADGET_RT))
    }

    pub fn lookup(name: &str) -> Option<Self> {
        Self::NAMED.iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, s)| *s)
    }

    /// The instruction word patched into the gadget.
    pub fn encoding(&self) -> u32 { self.0 }

    /// The `op0:op1:CRn:CRm:op2` field identifying the register.
    pub fn sysreg(&self) -> u32 { (self.0 >> 5) & 0xffff }
}

impl fmt::Debug for RegisterSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = self.sysreg();
        write!(f, "S{}_{}_C{}_C{}_{} ({:08x})",
            2 | ((s >> 14) & 1), (s >> 11) & 7, (s >> 7) & 0xf,
            (s >> 3) & 0xf, s & 7, self.0
        )
    }
}

/// Mode selector for the no-flush variant.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LeakMode {
    /// Leak a bit.
    Leak,
    /// Thrash the cache and re-prime the secret.
    Thrash,
}
impl LeakMode {
    pub fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            0 => Some(Self::Leak),
            1 => Some(Self::Thrash),
            _ => None,
        }
    }
    pub fn raw(&self) -> i32 {
        match self {
            Self::Leak => 0,
            Self::Thrash => 1,
        }
    }
}

fn word(buf: &[u8], idx: usize) -> [u8; 4] {
    let mut w = [0u8; 4];
    w.copy_from_slice(&buf[idx * 4..idx * 4 + 4]);
    w
}

/// Implemented on the request layouts of each leak variant.
pub trait WireRequest: Sized {
    /// Size of the datagram in bytes.
    const LEN: usize;
    fn decode(buf: &[u8]) -> Option<Self>;
    fn encode(&self) -> Vec<u8>;
}

/// `{ bit: i32 }`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BitRequest {
    pub bit: BitIndex,
}
impl WireRequest for BitRequest {
    const LEN: usize = 4;
    fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() != Self::LEN {
            return None;
        }
        Some(Self { bit: BitIndex(i32::from_ne_bytes(word(buf, 0))) })
    }
    fn encode(&self) -> Vec<u8> {
        self.bit.0.to_ne_bytes().to_vec()
    }
}

/// `{ bit: i32, selector: u32 }`
///
/// The selector is kept raw here; validation happens in the variant.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RegisterRequest {
    pub bit: BitIndex,
    pub selector: u32,
}
impl WireRequest for RegisterRequest {
    const LEN: usize = 8;
    fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() != Self::LEN {
            return None;
        }
        Some(Self {
            bit: BitIndex(i32::from_ne_bytes(word(buf, 0))),
            selector: u32::from_ne_bytes(word(buf, 1)),
        })
    }
    fn encode(&self) -> Vec<u8> {
        let mut v = self.bit.0.to_ne_bytes().to_vec();
        v.extend_from_slice(&self.selector.to_ne_bytes());
        v
    }
}

/// `{ bit: i32, option: i32 }`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ModeRequest {
    pub bit: BitIndex,
    pub option: i32,
}
impl ModeRequest {
    pub fn mode(&self) -> Option<LeakMode> { LeakMode::from_raw(self.option) }
}
impl WireRequest for ModeRequest {
    const LEN: usize = 8;
    fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() != Self::LEN {
            return None;
        }
        Some(Self {
            bit: BitIndex(i32::from_ne_bytes(word(buf, 0))),
            option: i32::from_ne_bytes(word(buf, 1)),
        })
    }
    fn encode(&self) -> Vec<u8> {
        let mut v = self.bit.0.to_ne_bytes().to_vec();
        v.extend_from_slice(&self.option.to_ne_bytes());
        v
    }
}
