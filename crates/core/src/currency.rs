//! Currency value object.
//!
//! An account's currency is fixed at creation; transfers only move money
//! between accounts of the same currency.

use core::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::error::LedgerError;

/// Supported currency codes.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Currency {
    Usd,
    Eur,
    Cad,
}

impl Currency {
    pub const ALL: [Currency; 3] = [Currency::Usd, Currency::Eur, Currency::Cad];

    pub fn code(self) -> &'static str {
        match self {
            Currency::Usd => "USD",
            Currency::Eur => "EUR",
            Currency::Cad => "CAD",
        }
    }
}

impl core::fmt::Display for Currency {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for Currency {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "USD" => Ok(Currency::Usd),
            "EUR" => Ok(Currency::Eur),
            "CAD" => Ok(Currency::Cad),
            other => Err(LedgerError::invalid_input(format!(
                "unsupported currency: {other}"
            ))),
        }
    }
}

impl TryFrom<String> for Currency {
    type Error = LedgerError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Currency> for String {
    fn from(value: Currency) -> Self {
        value.code().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn rejects_unsupported_codes() {
        assert!(matches!(
            "GBP".parse::<Currency>(),
            Err(LedgerError::InvalidInput(_))
        ));
        assert!("usd".parse::<Currency>().is_err());
    }

    #[test]
    fn serializes_as_code() {
        let json = serde_json::to_string(&Currency::Cad).unwrap();
        assert_eq!(json, "\"CAD\"");
        let back: Currency = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Currency::Cad);
        assert!(serde_json::from_str::<Currency>("\"JPY\"").is_err());
    }

    proptest! {
        #[test]
        fn only_supported_codes_parse(s in "[A-Z]{3}") {
            let parsed = s.parse::<Currency>();
            prop_assert_eq!(parsed.is_ok(), Currency::ALL.iter().any(|c| c.code() == s));
        }
    }
}
