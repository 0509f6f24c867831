//! Reusable patch shapes.

use crate::{
    error::Result,
    sql::{AddColumn, Column, DropColumn, DropTable, Identifier},
    work::{column_exists, table_exists, TxContext},
};

use super::Patch;

/// Adds one column to an existing table.
#[derive(Debug, Clone)]
pub struct AddColumnPatch {
    name: String,
    statement: AddColumn,
}

impl AddColumnPatch {
    pub fn new(name: impl Into<String>, table: Identifier, column: Column) -> Self {
        Self {
            name: name.into(),
            statement: AddColumn::new(table, column),
        }
    }
}

impl Patch for AddColumnPatch {
    fn name(&self) -> &str {
        &self.name
    }

    fn has_been_applied(&self, ctx: &TxContext<'_>) -> Result<bool> {
        ctx.query(&column_exists(
            ctx.dialect(),
            self.statement.table(),
            self.statement.column().name(),
        ))
    }

    fn apply(&self, ctx: &TxContext<'_>) -> Result<()> {
        ctx.execute_batch_sql(&self.statement.to_sql(ctx.dialect()))
    }
}

/// Removes a table that is no longer used.
#[derive(Debug, Clone)]
pub struct DropTablePatch {
    name: String,
    table: Identifier,
}

impl DropTablePatch {
    pub fn new(name: impl Into<String>, table: Identifier) -> Self {
        Self {
            name: name.into(),
            table,
        }
    }
}

impl Patch for DropTablePatch {
    fn name(&self) -> &str {
        &self.name
    }

    fn has_been_applied(&self, ctx: &TxContext<'_>) -> Result<bool> {
        Ok(!ctx.query(&table_exists(ctx.dialect(), &self.table))?)
    }

    fn apply(&self, ctx: &TxContext<'_>) -> Result<()> {
        ctx.execute_batch_sql(&DropTable::new(self.table.clone()).to_sql(ctx.dialect()))
    }
}

/// Moves the data of a legacy column into its replacement, then drops the
/// legacy column.
///
/// The replacement column is added first when missing. Applied once the
/// legacy column is gone.
#[derive(Debug, Clone)]
pub struct CopyColumnPatch {
    name: String,
    table: Identifier,
    from: Identifier,
    to: Column,
    factor: Option<i64>,
}

impl CopyColumnPatch {
    pub fn new(name: impl Into<String>, table: Identifier, from: Identifier, to: Column) -> Self {
        Self {
            name: name.into(),
            table,
            from,
            to,
            factor: None,
        }
    }

    /// Scales copied values, e.g. seconds to milliseconds.
    pub fn multiplied_by(mut self, factor: i64) -> Self {
        self.factor = Some(factor);
        self
    }

    fn copy_sql(&self) -> String {
        let source = match self.factor {
            Some(factor) => format!("{} * {factor}", self.from),
            None => self.from.to_string(),
        };
        format!("UPDATE {} SET {} = {source}", self.table, self.to.name())
    }
}

impl Patch for CopyColumnPatch {
    fn name(&self) -> &str {
        &self.name
    }

    fn has_been_applied(&self, ctx: &TxContext<'_>) -> Result<bool> {
        Ok(!ctx.query(&column_exists(ctx.dialect(), &self.table, &self.from))?)
    }

    fn apply(&self, ctx: &TxContext<'_>) -> Result<()> {
        let dialect = ctx.dialect();
        if !ctx.query(&column_exists(dialect, &self.table, self.to.name()))? {
            ctx.execute_batch_sql(&AddColumn::new(self.table.clone(), self.to.clone()).to_sql(dialect))?;
        }
        ctx.execute_batch_sql(&self.copy_sql())?;
        ctx.execute_batch_sql(&DropColumn::new(self.table.clone(), self.from.clone()).to_sql(dialect))
    }
}
