pub mod calculator;
pub mod checkout;
pub mod escalation;
pub mod events;
pub mod memory;
pub mod models;
pub mod processor;
pub mod reducer;
pub mod reports;
pub mod repository;
pub mod settlement;
pub mod store;

pub use calculator::{
    CalculationError, CartLine, CheckoutRequest, CheckoutSettings, LineError, LineIssue, OrderBreakdown,
    OrderCalculator, PricedOrder, VendorBreakdown,
};
pub use checkout::{CheckoutError, CheckoutReceipt, CheckoutService};
pub use escalation::{CaptureIssue, Escalation, EscalationKind};
pub use events::{EventParseError, GatewayEvent, PaymentUpdate, WebhookEvent};
pub use memory::InMemoryStore;
pub use models::{
    CustomerContact, Order, OrderItem, OrderStatus, PaymentStatus, Shipment, ShippingAddress, VendorSplit,
};
pub use processor::{WebhookAck, WebhookError, WebhookProcessor};
pub use reducer::{Decision, Effect, IgnoreReason};
pub use reports::{OrderFilter, OrderSummary, PayoutBalance, ProductSales, VendorOrderSummary, VendorSales};
pub use repository::{
    EscalationRepository, OrderRepository, OrderTransaction, PayoutRepository, RepoError, RepoResult,
};
pub use settlement::{
    Payout, PayoutOutcome, PayoutStatus, SettlementEngine, SettlementError, SettlementReport,
};
pub use store::{FulfilmentStep, OrderError, OrderStore};
