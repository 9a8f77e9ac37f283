//! Component Addresses
//!
//! Logical roles a component plays inside the platform. The switchboard maps
//! each role to the endpoint of the mailbox currently filling it.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Logical address of a component role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Address {
    /// Message bus holding the active switchboard
    Bus,
    /// Supervisor receiving fault notifications
    Supervisor,
    /// Market-data provider
    MarketData,
    /// Network publisher (outbound distribution)
    Publisher,
    /// Network consumer (inbound distribution)
    Consumer,
    /// FIX session gateway
    FixGateway,
    /// Brokerage connectivity
    Broker,
    /// Order execution service
    Execution,
    /// Portfolio service
    Portfolio,
    /// Strategy host
    Strategy,
    /// Calendar job scheduler
    Scheduler,
}

impl Address {
    /// Every address, in declaration order
    pub const ALL: [Address; 11] = [
        Address::Bus,
        Address::Supervisor,
        Address::MarketData,
        Address::Publisher,
        Address::Consumer,
        Address::FixGateway,
        Address::Broker,
        Address::Execution,
        Address::Portfolio,
        Address::Strategy,
        Address::Scheduler,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Address::Bus => "bus",
            Address::Supervisor => "supervisor",
            Address::MarketData => "market_data",
            Address::Publisher => "publisher",
            Address::Consumer => "consumer",
            Address::FixGateway => "fix_gateway",
            Address::Broker => "broker",
            Address::Execution => "execution",
            Address::Portfolio => "portfolio",
            Address::Strategy => "strategy",
            Address::Scheduler => "scheduler",
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Address {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        Address::ALL
            .iter()
            .copied()
            .find(|address| address.as_str() == normalized)
            .ok_or_else(|| format!("Unknown address: {}", s))
    }
}
