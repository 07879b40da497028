//! Aggregates persisted by the unit of work.
//!
//! An aggregate embeds an [`AggregateRoot`] that carries its id, the version
//! it was loaded at and the domain events raised since. Saving the aggregate
//! drains those events into the same transaction as its state.

mod root;

pub use root::AggregateRoot;
pub(crate) use root::StagedEvent;

use serde::de::DeserializeOwned;
use serde::Serialize;

pub trait Aggregate: Serialize + DeserializeOwned + Send + Sync {
    /// Storage kind, e.g. `"Account"`.
    const KIND: &'static str;

    fn root(&self) -> &AggregateRoot;
    fn root_mut(&mut self) -> &mut AggregateRoot;

    fn id(&self) -> &str {
        self.root().id()
    }

    fn version(&self) -> u64 {
        self.root().version()
    }
}

/// Implement [`Aggregate`] for a struct with an embedded root field.
///
/// ```ignore
/// relay_rust::aggregate!(Account, "Account", root);
/// ```
#[macro_export]
macro_rules! aggregate {
    ($ty:ty, $kind:expr, $root:ident) => {
        impl $crate::Aggregate for $ty {
            const KIND: &'static str = $kind;

            fn root(&self) -> &$crate::AggregateRoot {
                &self.$root
            }

            fn root_mut(&mut self) -> &mut $crate::AggregateRoot {
                &mut self.$root
            }
        }
    };
}
