pub mod alert;
pub mod ledger;
pub mod notifier;
pub mod period;

use chrono::NaiveDateTime;

pub use alert::{AlertEvaluator, SpendingNotification, SpendingStatus};
pub use ledger::{ActiveLimit, LimitLedger};
pub use notifier::SpendingNotifier;
pub use period::{compute_window, Period};

/// Wall-clock time in the server's local zone, the zone period windows are
/// computed in.
pub fn now_local() -> NaiveDateTime {
    chrono::Local::now().naive_local()
}
