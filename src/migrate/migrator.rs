//! Schema change operation batch with dialect-specific rendering.
//!
//! Operations are accumulated, not executed, as they are requested; `run`
//! renders and applies them strictly in accumulation order. The caller owns
//! the surrounding transaction, so a failed operation rolls back the whole
//! step together with its history record.
//!
//! Rendering is polymorphic over the database family: [`Dialect`] supplies
//! generic ANSI statements and each family overrides only the grammar that
//! differs (column type alteration is the canonical case).

use crate::conn::driver::DbConnection;
use crate::conn::url::DatabaseType;
use crate::error::{DbError, DbResult};
use tracing::debug;

/// Column definition used by add/change column operations.
#[derive(Debug, Clone)]
pub struct ColumnDef {
    pub name: String,
    pub sql_type: String,
    pub not_null: bool,
    pub default: Option<String>,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, sql_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sql_type: sql_type.into(),
            not_null: false,
            default: None,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.not_null = true;
        self
    }

    /// Default value, rendered verbatim into the DDL.
    pub fn default_value(mut self, value: impl Into<String>) -> Self {
        self.default = Some(value.into());
        self
    }

    fn render(&self) -> String {
        let mut sql = format!("{} {}", self.name, self.sql_type);
        if self.not_null {
            sql.push_str(" NOT NULL");
        }
        if let Some(default) = &self.default {
            sql.push_str(" DEFAULT ");
            sql.push_str(default);
        }
        sql
    }
}

/// One accumulated schema change.
#[derive(Debug, Clone)]
pub enum SchemaOp {
    AddColumn {
        table: String,
        column: ColumnDef,
    },
    DropColumn {
        table: String,
        column: String,
    },
    RenameColumn {
        table: String,
        from: String,
        to: String,
    },
    RenameTable {
        from: String,
        to: String,
    },
    AddIndex {
        table: String,
        name: String,
        columns: Vec<String>,
        unique: bool,
    },
    DropIndex {
        table: String,
        name: String,
    },
    AddNotNull {
        table: String,
        column: String,
    },
    DropNotNull {
        table: String,
        column: String,
    },
    AddDefault {
        table: String,
        column: String,
        value: String,
    },
    /// Full column redefinition; dialects that cannot change type and
    /// nullability in one statement render the split themselves.
    ChangeColumn {
        table: String,
        column: ColumnDef,
    },
    RawSql {
        sql: String,
    },
}

/// SQL grammar for one database family. Defaults render generic ANSI;
/// families override only what differs.
pub trait Dialect: Send + Sync {
    fn name(&self) -> &'static str;

    fn add_column(&self, table: &str, column: &ColumnDef) -> DbResult<Vec<String>> {
        Ok(vec![format!(
            "ALTER TABLE {} ADD COLUMN {}",
            table,
            column.render()
        )])
    }

    fn drop_column(&self, table: &str, column: &str) -> DbResult<Vec<String>> {
        Ok(vec![format!("ALTER TABLE {} DROP COLUMN {}", table, column)])
    }

    fn rename_column(&self, table: &str, from: &str, to: &str) -> DbResult<Vec<String>> {
        Ok(vec![format!(
            "ALTER TABLE {} RENAME COLUMN {} TO {}",
            table, from, to
        )])
    }

    fn rename_table(&self, from: &str, to: &str) -> DbResult<Vec<String>> {
        Ok(vec![format!("ALTER TABLE {} RENAME TO {}", from, to)])
    }

    fn add_index(
        &self,
        table: &str,
        name: &str,
        columns: &[String],
        unique: bool,
    ) -> DbResult<Vec<String>> {
        let unique = if unique { "UNIQUE " } else { "" };
        Ok(vec![format!(
            "CREATE {}INDEX {} ON {} ({})",
            unique,
            name,
            table,
            columns.join(", ")
        )])
    }

    fn drop_index(&self, _table: &str, name: &str) -> DbResult<Vec<String>> {
        Ok(vec![format!("DROP INDEX {}", name)])
    }

    fn add_not_null(&self, table: &str, column: &str) -> DbResult<Vec<String>> {
        Ok(vec![format!(
            "ALTER TABLE {} ALTER COLUMN {} SET NOT NULL",
            table, column
        )])
    }

    fn drop_not_null(&self, table: &str, column: &str) -> DbResult<Vec<String>> {
        Ok(vec![format!(
            "ALTER TABLE {} ALTER COLUMN {} DROP NOT NULL",
            table, column
        )])
    }

    fn add_default(&self, table: &str, column: &str, value: &str) -> DbResult<Vec<String>> {
        Ok(vec![format!(
            "ALTER TABLE {} ALTER COLUMN {} SET DEFAULT {}",
            table, column, value
        )])
    }

    /// Redefine a column. The generic grammar cannot change a column's type
    /// and its nullability in one statement, so the default renders the type
    /// change first and re-applies NOT NULL and the default afterwards.
    fn change_column(&self, table: &str, column: &ColumnDef) -> DbResult<Vec<String>> {
        let mut statements = vec![format!(
            "ALTER TABLE {} ALTER COLUMN {} TYPE {}",
            table, column.name, column.sql_type
        )];
        if column.not_null {
            statements.extend(self.add_not_null(table, &column.name)?);
        }
        if let Some(default) = &column.default {
            statements.extend(self.add_default(table, &column.name, default)?);
        }
        Ok(statements)
    }

    fn render(&self, op: &SchemaOp) -> DbResult<Vec<String>> {
        match op {
            SchemaOp::AddColumn { table, column } => self.add_column(table, column),
            SchemaOp::DropColumn { table, column } => self.drop_column(table, column),
            SchemaOp::RenameColumn { table, from, to } => self.rename_column(table, from, to),
            SchemaOp::RenameTable { from, to } => self.rename_table(from, to),
            SchemaOp::AddIndex {
                table,
                name,
                columns,
                unique,
            } => self.add_index(table, name, columns, *unique),
            SchemaOp::DropIndex { table, name } => self.drop_index(table, name),
            SchemaOp::AddNotNull { table, column } => self.add_not_null(table, column),
            SchemaOp::DropNotNull { table, column } => self.drop_not_null(table, column),
            SchemaOp::AddDefault {
                table,
                column,
                value,
            } => self.add_default(table, column, value),
            SchemaOp::ChangeColumn { table, column } => self.change_column(table, column),
            SchemaOp::RawSql { sql } => Ok(vec![sql.clone()]),
        }
    }
}

/// Generic ANSI dialect, used when no family override applies.
pub struct GenericDialect;

impl Dialect for GenericDialect {
    fn name(&self) -> &'static str {
        "generic"
    }
}

pub struct PostgresDialect;

impl Dialect for PostgresDialect {
    fn name(&self) -> &'static str {
        "postgres"
    }

    fn change_column(&self, table: &str, column: &ColumnDef) -> DbResult<Vec<String>> {
        let mut statements = vec![format!(
            "ALTER TABLE {} ALTER COLUMN {} TYPE {} USING {}::{}",
            table, column.name, column.sql_type, column.name, column.sql_type
        )];
        if column.not_null {
            statements.extend(self.add_not_null(table, &column.name)?);
        }
        if let Some(default) = &column.default {
            statements.extend(self.add_default(table, &column.name, default)?);
        }
        Ok(statements)
    }
}

pub struct MySqlDialect;

impl Dialect for MySqlDialect {
    fn name(&self) -> &'static str {
        "mysql"
    }

    fn drop_index(&self, table: &str, name: &str) -> DbResult<Vec<String>> {
        Ok(vec![format!("DROP INDEX {} ON {}", name, table)])
    }

    /// MODIFY COLUMN takes the full redefinition, nullability and default
    /// included, in one statement.
    fn change_column(&self, table: &str, column: &ColumnDef) -> DbResult<Vec<String>> {
        Ok(vec![format!(
            "ALTER TABLE {} MODIFY COLUMN {}",
            table,
            column.render()
        )])
    }

    // MODIFY COLUMN needs the full redefinition, which only the caller has.
    fn add_not_null(&self, table: &str, column: &str) -> DbResult<Vec<String>> {
        Err(DbError::unsupported(format!(
            "MySQL cannot alter nullability of {}.{} without the full column \
             definition; use change_column or raw_sql",
            table, column
        )))
    }

    fn drop_not_null(&self, table: &str, column: &str) -> DbResult<Vec<String>> {
        Err(DbError::unsupported(format!(
            "MySQL cannot alter nullability of {}.{} without the full column \
             definition; use change_column or raw_sql",
            table, column
        )))
    }
}

pub struct SqliteDialect;

impl SqliteDialect {
    fn in_place_alter(&self, what: &str, table: &str, column: &str) -> DbError {
        DbError::unsupported(format!(
            "SQLite cannot {} on {}.{} in place; rebuild the column with \
             change_column or raw_sql",
            what, table, column
        ))
    }
}

impl Dialect for SqliteDialect {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn add_not_null(&self, table: &str, column: &str) -> DbResult<Vec<String>> {
        Err(self.in_place_alter("add NOT NULL", table, column))
    }

    fn drop_not_null(&self, table: &str, column: &str) -> DbResult<Vec<String>> {
        Err(self.in_place_alter("drop NOT NULL", table, column))
    }

    fn add_default(&self, table: &str, column: &str, _value: &str) -> DbResult<Vec<String>> {
        Err(self.in_place_alter("set a default", table, column))
    }

    /// No ALTER COLUMN TYPE; rebuild through a temporary column that carries
    /// the new definition. ADD COLUMN only accepts NOT NULL alongside a
    /// non-null default, so that combination is required here.
    fn change_column(&self, table: &str, column: &ColumnDef) -> DbResult<Vec<String>> {
        if column.not_null && column.default.is_none() {
            return Err(DbError::unsupported(format!(
                "SQLite can only rebuild {}.{} as NOT NULL when the column \
                 has a DEFAULT; add one or use raw_sql",
                table, column.name
            )));
        }
        let tmp = format!("{}__tmp", column.name);
        let mut tmp_def = ColumnDef::new(tmp.clone(), column.sql_type.clone());
        tmp_def.not_null = column.not_null;
        tmp_def.default = column.default.clone();
        Ok(vec![
            format!("ALTER TABLE {} ADD COLUMN {}", table, tmp_def.render()),
            format!(
                "UPDATE {} SET {} = CAST({} AS {})",
                table, tmp, column.name, column.sql_type
            ),
            format!("ALTER TABLE {} DROP COLUMN {}", table, column.name),
            format!(
                "ALTER TABLE {} RENAME COLUMN {} TO {}",
                table, tmp, column.name
            ),
        ])
    }
}

/// Select the dialect for a database family once, at construction.
pub fn dialect_for(db_type: DatabaseType) -> Box<dyn Dialect> {
    match db_type {
        DatabaseType::PostgreSQL => Box::new(PostgresDialect),
        DatabaseType::MySQL => Box::new(MySqlDialect),
        DatabaseType::SQLite => Box::new(SqliteDialect),
    }
}

/// Accumulates schema operations for one migration step and executes them
/// as a batch, in order, on a caller-provided connection.
pub struct SchemaMigrator {
    dialect: Box<dyn Dialect>,
    ops: Vec<SchemaOp>,
}

impl SchemaMigrator {
    pub fn new(db_type: DatabaseType) -> Self {
        Self {
            dialect: dialect_for(db_type),
            ops: Vec::new(),
        }
    }

    /// Generic renderer independent of any concrete family.
    pub fn generic() -> Self {
        Self {
            dialect: Box::new(GenericDialect),
            ops: Vec::new(),
        }
    }

    pub fn add_column(&mut self, table: impl Into<String>, column: ColumnDef) -> &mut Self {
        self.ops.push(SchemaOp::AddColumn {
            table: table.into(),
            column,
        });
        self
    }

    pub fn drop_column(
        &mut self,
        table: impl Into<String>,
        column: impl Into<String>,
    ) -> &mut Self {
        self.ops.push(SchemaOp::DropColumn {
            table: table.into(),
            column: column.into(),
        });
        self
    }

    pub fn rename_column(
        &mut self,
        table: impl Into<String>,
        from: impl Into<String>,
        to: impl Into<String>,
    ) -> &mut Self {
        self.ops.push(SchemaOp::RenameColumn {
            table: table.into(),
            from: from.into(),
            to: to.into(),
        });
        self
    }

    pub fn rename_table(&mut self, from: impl Into<String>, to: impl Into<String>) -> &mut Self {
        self.ops.push(SchemaOp::RenameTable {
            from: from.into(),
            to: to.into(),
        });
        self
    }

    pub fn add_index(
        &mut self,
        table: impl Into<String>,
        name: impl Into<String>,
        columns: &[&str],
        unique: bool,
    ) -> &mut Self {
        self.ops.push(SchemaOp::AddIndex {
            table: table.into(),
            name: name.into(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
            unique,
        });
        self
    }

    pub fn drop_index(&mut self, table: impl Into<String>, name: impl Into<String>) -> &mut Self {
        self.ops.push(SchemaOp::DropIndex {
            table: table.into(),
            name: name.into(),
        });
        self
    }

    pub fn add_not_null(
        &mut self,
        table: impl Into<String>,
        column: impl Into<String>,
    ) -> &mut Self {
        self.ops.push(SchemaOp::AddNotNull {
            table: table.into(),
            column: column.into(),
        });
        self
    }

    pub fn drop_not_null(
        &mut self,
        table: impl Into<String>,
        column: impl Into<String>,
    ) -> &mut Self {
        self.ops.push(SchemaOp::DropNotNull {
            table: table.into(),
            column: column.into(),
        });
        self
    }

    pub fn add_default(
        &mut self,
        table: impl Into<String>,
        column: impl Into<String>,
        value: impl Into<String>,
    ) -> &mut Self {
        self.ops.push(SchemaOp::AddDefault {
            table: table.into(),
            column: column.into(),
            value: value.into(),
        });
        self
    }

    /// Change a column's definition. Families that cannot redefine a
    /// column's type and its nullability in one statement render the type
    /// change with nullability relaxed, then a NOT NULL re-application;
    /// families with a single-statement grammar (MySQL MODIFY, the SQLite
    /// rebuild) keep it in one.
    pub fn change_column(&mut self, table: impl Into<String>, column: ColumnDef) -> &mut Self {
        self.ops.push(SchemaOp::ChangeColumn {
            table: table.into(),
            column,
        });
        self
    }

    pub fn raw_sql(&mut self, sql: impl Into<String>) -> &mut Self {
        self.ops.push(SchemaOp::RawSql { sql: sql.into() });
        self
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Render the accumulated batch without executing it.
    pub fn to_sql(&self) -> DbResult<Vec<String>> {
        let mut statements = Vec::new();
        for op in &self.ops {
            statements.extend(self.dialect.render(op)?);
        }
        Ok(statements)
    }

    /// Execute the batch in accumulation order on `conn`, then clear it.
    /// The caller owns the transaction; the first failure surfaces with the
    /// batch left intact so the step can be inspected or retried.
    pub async fn run(&mut self, conn: &mut DbConnection) -> DbResult<()> {
        let statements = self.to_sql()?;
        debug!(
            dialect = self.dialect.name(),
            statements = statements.len(),
            "Running schema batch"
        );
        for sql in &statements {
            conn.execute(sql).await?;
        }
        self.ops.clear();
        Ok(())
    }

    /// Discard the accumulated operations without executing them (fake run).
    pub fn clean(&mut self) {
        self.ops.clear();
    }
}
