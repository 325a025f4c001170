// Payment node backends: the LnNode capability set, an LND REST client and
// an in-process simulated network.

pub mod lnd;
pub mod node;
pub mod sim;

pub use lnd::{LndConfig, LndError, LndNode};
pub use node::{InvoiceStream, LnNode, PaymentStream, RouteEstimate};
pub use sim::{SimNetwork, SimNode};
