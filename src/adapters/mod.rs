// Adapters layer: concrete implementations for external systems (recipient files, messaging API).

pub mod tabular;
pub mod whatsapp;
