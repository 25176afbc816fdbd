pub mod store;
pub mod types;
pub mod watcher;

pub use self::store::ConfigStore;
pub use self::types::{
    ApiStyle, ClientDialect, OAuthCredential, OpKind, OpPosition, Provider, ProviderAuth, RouteOp,
    Rule, Service, Snapshot,
};
