mod check;
mod chunk;
mod envelope;
mod recipient;

pub use check::{CheckDecision, CheckResult, GreylistingKey};
pub use chunk::{join, Chunk};
pub use envelope::{Envelope, EnvelopeId};
pub use recipient::{add_recipient_deduped, DeliveryStatus, GreylistingProbe, RateControlProbe, Recipient};
