pub mod store;

pub use store::BridgeConfig;
