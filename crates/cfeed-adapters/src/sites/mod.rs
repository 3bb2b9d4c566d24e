//! One adapter per classifieds site.

pub mod acheiusa;
pub mod brazilianvoice;

pub use acheiusa::AcheiUsaAdapter;
pub use brazilianvoice::BrazilianVoiceAdapter;
