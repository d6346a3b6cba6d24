//! HTTP adapters for the external collaborators: the payment gateway and
//! the AI provider behind the metered actions.

pub mod openai;
pub mod paystack;

pub use openai::{OpenAiConfig, OpenAiOperation};
pub use paystack::{PaystackConfig, PaystackGateway};
