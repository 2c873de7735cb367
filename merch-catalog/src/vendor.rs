use merch_shared::Rate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Commission taken when a vendor account carries no explicit rate (15%).
pub const DEFAULT_COMMISSION: Rate = Rate::from_basis_points(1500);

/// A vendor's connected payment account, as last reported by the gateway.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VendorAccount {
    pub vendor_id: Uuid,
    pub external_account_id: Option<String>,
    pub commission_rate: Rate,
    pub charges_enabled: bool,
    pub payouts_enabled: bool,
    pub details_submitted: bool,
}

impl VendorAccount {
    /// Whether the vendor's products may be sold right now
    pub fn is_payment_capable(&self) -> bool {
        self.charges_enabled && self.external_account_id.as_deref().is_some_and(|id| !id.is_empty())
    }
}

/// Capability refresh carried by an `account.updated` gateway event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AccountUpdate {
    pub external_account_id: String,
    pub charges_enabled: bool,
    pub payouts_enabled: bool,
    pub details_submitted: bool,
}

impl VendorAccount {
    pub fn apply(&mut self, update: &AccountUpdate) {
        self.charges_enabled = update.charges_enabled;
        self.payouts_enabled = update.payouts_enabled;
        self.details_submitted = update.details_submitted;
    }
}
