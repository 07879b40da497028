//! Transport contract tests.
//!
//! The same scenarios run against every backend, each on its in-memory
//! broker. Networked backends additionally run the reconnect scenario.

mod contract;
mod support;

use support::Broker;

macro_rules! scenario {
    ($backend:ident, $name:ident) => {
        #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
        async fn $name() {
            contract::$name(Broker::$backend()).await;
        }
    };
}

macro_rules! transport_contract {
    ($backend:ident $(, $extra:ident)*) => {
        mod $backend {
            use super::*;

            scenario!($backend, publishes_before_the_first_subscription_are_not_seen);
            scenario!($backend, publishes_while_the_group_is_offline_are_retained);
            scenario!($backend, failed_messages_are_redelivered);
            scenario!($backend, slow_handlers_are_treated_as_failures);
            scenario!($backend, competing_consumers_share_the_work);
            scenario!($backend, missing_topics_fail_fast_without_auto_create);
            scenario!($backend, one_live_subscription_per_group);
            scenario!($backend, disposal_is_idempotent);
            $(scenario!($backend, $extra);)*
        }
    };
}

transport_contract!(in_process);
transport_contract!(amqp, consumers_and_publishers_survive_a_severed_connection);
transport_contract!(log, consumers_and_publishers_survive_a_severed_connection);
transport_contract!(cloud, consumers_and_publishers_survive_a_severed_connection);
