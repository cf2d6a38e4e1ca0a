use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Optional feature a provider may support
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Invoices,
    Payouts,
    PaymentSessions,
    ThreeDSecure,
    ManualCapture,
    Balance,
    PaymentMethods,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Capability::Invoices => write!(f, "invoices"),
            Capability::Payouts => write!(f, "payouts"),
            Capability::PaymentSessions => write!(f, "payment sessions"),
            Capability::ThreeDSecure => write!(f, "3D Secure"),
            Capability::ManualCapture => write!(f, "manual capture"),
            Capability::Balance => write!(f, "balance"),
            Capability::PaymentMethods => write!(f, "payment methods"),
        }
    }
}

/// Feature set of one provider instance
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct ProviderCapabilities {
    pub invoices: bool,
    pub payouts: bool,
    pub payment_sessions: bool,
    pub three_d_secure: bool,
    pub manual_capture: bool,
    pub balance: bool,
    pub payment_methods: bool,
    /// Upper-case ISO 4217 codes. Empty means the provider does not restrict currencies.
    pub currencies: BTreeSet<String>,
    pub payment_method_types: BTreeSet<String>,
}

impl ProviderCapabilities {
    pub fn new<I, S>(currencies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            currencies: currencies
                .into_iter()
                .map(|c| c.as_ref().to_uppercase())
                .collect(),
            ..Default::default()
        }
    }

    pub fn with(mut self, capability: Capability) -> Self {
        match capability {
            Capability::Invoices => self.invoices = true,
            Capability::Payouts => self.payouts = true,
            Capability::PaymentSessions => self.payment_sessions = true,
            Capability::ThreeDSecure => self.three_d_secure = true,
            Capability::ManualCapture => self.manual_capture = true,
            Capability::Balance => self.balance = true,
            Capability::PaymentMethods => self.payment_methods = true,
        }
        self
    }

    pub fn with_payment_method_types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.payment_method_types = types.into_iter().map(Into::into).collect();
        self
    }

    pub fn supports(&self, capability: Capability) -> bool {
        match capability {
            Capability::Invoices => self.invoices,
            Capability::Payouts => self.payouts,
            Capability::PaymentSessions => self.payment_sessions,
            Capability::ThreeDSecure => self.three_d_secure,
            Capability::ManualCapture => self.manual_capture,
            Capability::Balance => self.balance,
            Capability::PaymentMethods => self.payment_methods,
        }
    }

    pub fn supports_currency(&self, currency: &str) -> bool {
        self.currencies.is_empty() || self.currencies.contains(&currency.to_uppercase())
    }

    pub fn supports_payment_method_type(&self, method_type: &str) -> bool {
        self.payment_method_types.is_empty() || self.payment_method_types.contains(method_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_currency_support_is_case_insensitive() {
        let caps = ProviderCapabilities::new(["usd", "EUR"]);
        assert!(caps.supports_currency("USD"));
        assert!(caps.supports_currency("eur"));
        assert!(!caps.supports_currency("IDR"));
    }

    #[test]
    fn test_empty_currency_set_accepts_all() {
        let caps = ProviderCapabilities::default();
        assert!(caps.supports_currency("JPY"));
    }

    #[test]
    fn test_flags() {
        let caps = ProviderCapabilities::new(["USD"])
            .with(Capability::Payouts)
            .with(Capability::ManualCapture)
            .with_payment_method_types(["card"]);
        assert!(caps.supports(Capability::Payouts));
        assert!(caps.supports(Capability::ManualCapture));
        assert!(!caps.supports(Capability::Invoices));
        assert!(caps.supports_payment_method_type("card"));
        assert!(!caps.supports_payment_method_type("ewallet"));
    }
}
