//! Security identifiers.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SecurityType {
    /// Custom or alternative data with no tradable market of its own.
    Base,
    Equity,
    Forex,
    Cfd,
    Crypto,
    Index,
    Future,
    Option,
    FutureOption,
}

impl SecurityType {
    pub fn is_option(self) -> bool {
        matches!(self, SecurityType::Option | SecurityType::FutureOption)
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "base" | "custom" => Some(SecurityType::Base),
            "equity" => Some(SecurityType::Equity),
            "forex" => Some(SecurityType::Forex),
            "cfd" => Some(SecurityType::Cfd),
            "crypto" => Some(SecurityType::Crypto),
            "index" => Some(SecurityType::Index),
            "future" => Some(SecurityType::Future),
            "option" => Some(SecurityType::Option),
            "futureoption" | "future_option" => Some(SecurityType::FutureOption),
            _ => None,
        }
    }
}

/// Identifies a security, optionally linked to the underlying it derives from.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Symbol {
    pub value: String,
    pub security_type: SecurityType,
    pub underlying: Option<Box<Symbol>>,
}

impl Symbol {
    pub fn new(value: impl Into<String>, security_type: SecurityType) -> Self {
        Symbol {
            value: value.into().to_uppercase(),
            security_type,
            underlying: None,
        }
    }

    pub fn derivative(
        value: impl Into<String>,
        security_type: SecurityType,
        underlying: Symbol,
    ) -> Self {
        Symbol {
            value: value.into().to_uppercase(),
            security_type,
            underlying: Some(Box::new(underlying)),
        }
    }

    /// The chain-level option symbol of an underlying, e.g. `?SPY`.
    pub fn canonical_option(underlying: Symbol) -> Self {
        let value = format!("?{}", underlying.value);
        Symbol::derivative(value, SecurityType::Option, underlying)
    }

    pub fn has_underlying(&self) -> bool {
        self.underlying.is_some()
    }

    pub fn underlying(&self) -> Option<&Symbol> {
        self.underlying.as_deref()
    }

    pub fn is_canonical(&self) -> bool {
        self.value.starts_with('?')
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.value)
    }
}
