//! The capability set the chat service needs from a payment node.

use async_trait::async_trait;
use futures::stream::BoxStream;

use lnchat_shared::ln::{
    ChannelPoint, LnInvoice, LnPayment, OpenChannelRequest, PayReq, Route, SelfBalance, SelfInfo,
    SendPaymentRequest,
};
use lnchat_shared::{Address, Node, PaymentOptions, Result};

/// Invoice updates, at least once, in node order.
pub type InvoiceStream = BoxStream<'static, Result<LnInvoice>>;

/// Payment updates, at least once, in node order.
pub type PaymentStream = BoxStream<'static, Result<LnPayment>>;

/// A route the node would use for a payment, and how likely it is to work.
#[derive(Debug, Clone, PartialEq)]
pub struct RouteEstimate {
    pub route: Route,
    pub success_prob: f64,
}

#[async_trait]
pub trait LnNode: Send + Sync {
    async fn get_self_info(&self) -> Result<SelfInfo>;

    async fn get_self_balance(&self) -> Result<SelfBalance>;

    /// Every node of the network graph known locally.
    async fn get_nodes(&self) -> Result<Vec<Node>>;

    /// Connect to a peer. Connecting to an already connected peer succeeds.
    async fn connect_node(&self, address: &Address, host_port: &str) -> Result<()>;

    async fn open_channel(&self, request: &OpenChannelRequest) -> Result<ChannelPoint>;

    async fn create_invoice(
        &self,
        memo: &str,
        amt_msat: i64,
        expiry: i64,
        private: bool,
    ) -> Result<LnInvoice>;

    async fn lookup_invoice(&self, pay_req: &str) -> Result<LnInvoice>;

    async fn decode_pay_req(&self, pay_req: &str) -> Result<PayReq>;

    /// Start a payment. The returned record may still be in flight; its
    /// final state arrives on [`LnNode::subscribe_payments`].
    async fn send_payment(&self, request: SendPaymentRequest) -> Result<LnPayment>;

    async fn probe_route(
        &self,
        dest: &Address,
        amt_msat: i64,
        options: &PaymentOptions,
    ) -> Result<RouteEstimate>;

    /// Settled invoices with a settle index at or above `from_settle_index`.
    async fn list_invoices(&self, from_settle_index: u64) -> Result<Vec<LnInvoice>>;

    /// Payments with a payment index at or above `from_payment_index`.
    async fn list_payments(&self, from_payment_index: u64) -> Result<Vec<LnPayment>>;

    async fn subscribe_invoices(&self, from_settle_index: u64) -> Result<InvoiceStream>;

    async fn subscribe_payments(&self, from_payment_index: u64) -> Result<PaymentStream>;

    /// Sign with the node key; 65-byte compact recoverable signature.
    async fn sign_message(&self, message: &[u8]) -> Result<Vec<u8>>;

    /// Address of the key that produced `signature` over `message`.
    async fn verify_message(&self, message: &[u8], signature: &[u8]) -> Result<Address>;
}
