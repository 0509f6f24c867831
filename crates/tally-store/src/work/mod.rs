//! Units of work: reads ([`Query`]), writes ([`Executable`]) and their
//! composition into a [`Transaction`].

pub mod executable;
pub mod query;
pub mod transaction;

pub use executable::{BatchStatement, Executable, Statement};
pub use query::{column_exists, index_exists, row_count, table_exists, OptionalRowQuery, Query, RowsQuery};
pub use transaction::{critical_transaction, transaction, FnTransaction, Transaction, TxContext};
