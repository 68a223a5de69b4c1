//! VM domains and domain masks

use serde::{Deserialize, Serialize};

/// Which program a VM instance runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Domain {
    /// Server-side simulation logic
    Server,
    /// Client-side presentation logic
    Client,
    /// Menu and user-interface logic
    Ui,
}

impl Domain {
    /// All domains, in registry slot order
    pub const ALL: [Domain; 3] = [Domain::Server, Domain::Client, Domain::Ui];

    /// Registry slot of this domain
    #[inline]
    pub const fn slot(self) -> usize {
        match self {
            Self::Server => 0,
            Self::Client => 1,
            Self::Ui => 2,
        }
    }

    /// Lowercase name
    pub const fn name(self) -> &'static str {
        match self {
            Self::Server => "server",
            Self::Client => "client",
            Self::Ui => "ui",
        }
    }
}

impl std::fmt::Display for Domain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Set of domains a builtin may be called from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DomainMask(u8);

impl DomainMask {
    /// No domain
    pub const NONE: Self = Self(0);
    /// Server only
    pub const SERVER: Self = Self(1 << 0);
    /// Client only
    pub const CLIENT: Self = Self(1 << 1);
    /// UI only
    pub const UI: Self = Self(1 << 2);
    /// Every domain
    pub const ALL: Self = Self(0b111);

    /// Mask containing a single domain
    #[inline]
    pub const fn only(domain: Domain) -> Self {
        Self(1 << domain.slot())
    }

    /// Whether `domain` is in the mask
    #[inline]
    pub const fn contains(self, domain: Domain) -> bool {
        self.0 & (1 << domain.slot()) != 0
    }

    /// Union of two masks
    #[inline]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Whether the mask is empty
    #[inline]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl std::ops::BitOr for DomainMask {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

impl From<Domain> for DomainMask {
    fn from(domain: Domain) -> Self {
        Self::only(domain)
    }
}

impl std::fmt::Display for DomainMask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<_> = Domain::ALL
            .into_iter()
            .filter(|d| self.contains(*d))
            .map(Domain::name)
            .collect();
        if names.is_empty() {
            f.write_str("none")
        } else {
            f.write_str(&names.join("|"))
        }
    }
}
