pub mod payment;
pub mod retry;
pub mod signature;

pub use payment::{
    GatewayError, IntentMetadata, IntentRequest, MockPaymentGateway, PaymentGateway, PaymentIntent,
    TransferReceipt, TransferRequest,
};
pub use retry::{IsTransient, RetryPolicy};
pub use signature::{SignatureError, WebhookVerifier, SIGNATURE_HEADER};
