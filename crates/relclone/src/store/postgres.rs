//! PostgreSQL row store.
//!
//! The reference [`RowStore`] implementation. A [`PostgresPool`] introspects
//! the schema once at connection time; each [`PostgresStore`] checked out of
//! it is an independent clone session holding one pooled connection, its own
//! already-returned set, and its own mapping.
//!
//! Callers are expected to wrap mutating sessions in a transaction via
//! [`PostgresStore::begin`] / [`PostgresStore::commit`] so a failed upload
//! or merge leaves nothing behind.

use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use bytes::BytesMut;
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime};
use deadpool_postgres::{Manager, ManagerConfig, Object, Pool, RecyclingMethod};
use rust_decimal::Decimal;
use tokio_postgres::types::{to_sql_checked, IsNull, ToSql, Type};
use tokio_postgres::{Config as PgConfig, NoTls};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::DatabaseConfig;
use crate::core::{MappingEntry, RecordId, Row, Schema, Value, TABLE_KEY};
use crate::error::{CloneError, Result};

use super::RowStore;

/// Connections kept by the pool. One clone session uses one connection, so
/// this bounds the number of concurrent sessions.
const POOL_SIZE: usize = 4;

/// Complete foreign-key list, one row per referencing column.
const FOREIGN_KEY_QUERY: &str = r#"
SELECT
    (SELECT r.relname FROM pg_catalog.pg_class r WHERE r.oid = c.confrelid)::text AS base_table,
    a.attname::text AS base_col,
    (SELECT r.relname FROM pg_catalog.pg_class r WHERE r.oid = c.conrelid)::text AS referencing_table,
    UNNEST((
        SELECT array_agg(attname) FROM pg_catalog.pg_attribute
        WHERE attrelid = c.conrelid AND array[attnum] <@ c.conkey
    ))::text AS referencing_col
FROM pg_catalog.pg_constraint c
JOIN pg_catalog.pg_attribute a ON c.confrelid = a.attrelid AND a.attnum = ANY(confkey)
WHERE c.contype = 'f'
"#;

/// Tables with exactly one primary-key column, and that column.
const PRIMARY_KEY_QUERY: &str = r#"
SELECT
    t.relname::text AS table_name,
    (ARRAY_AGG(a.attname::text))[1]::text AS column_name
FROM pg_catalog.pg_class c
JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace
JOIN pg_catalog.pg_index i ON i.indexrelid = c.oid AND i.indisprimary
JOIN pg_catalog.pg_class t ON i.indrelid = t.oid
JOIN pg_catalog.pg_attribute a ON a.attrelid = i.indrelid AND a.attnum = ANY(i.indkey)
WHERE c.relkind = 'i'
  AND n.nspname NOT IN ('pg_catalog', 'pg_toast')
  AND pg_catalog.pg_table_is_visible(c.oid)
GROUP BY t.relname
HAVING COUNT(*) = 1
"#;

/// A connection pool plus the schema model introspected at connect time.
pub struct PostgresPool {
    pool: Pool,
    schema: Schema,
}

impl PostgresPool {
    /// Connect and introspect the schema.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let mut pg_config = PgConfig::new();
        pg_config.host(&config.host);
        pg_config.port(config.port);
        pg_config.dbname(&config.database);
        pg_config.user(&config.user);
        pg_config.password(&config.password);

        warn!("PostgreSQL TLS is not negotiated; credentials travel in plaintext");
        let mgr_config = ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        };
        let mgr = Manager::from_config(pg_config, NoTls, mgr_config);
        let pool = Pool::builder(mgr)
            .max_size(POOL_SIZE)
            .build()
            .map_err(|e| CloneError::pool(e, "creating PostgreSQL pool"))?;

        let client = pool
            .get()
            .await
            .map_err(|e| CloneError::pool(e, "testing PostgreSQL connection"))?;
        client.simple_query("SELECT 1").await?;

        let schema = introspect(&client).await?;
        info!(
            "connected to {}:{}/{}: {} tables with keys, {} foreign keys",
            config.host,
            config.port,
            config.database,
            schema.primary_keys.len(),
            schema.foreign_keys.len()
        );

        Ok(Self { pool, schema })
    }

    /// The schema model shared by every session of this pool.
    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Check out a fresh clone session.
    pub async fn store(&self) -> Result<PostgresStore> {
        let client = self
            .pool
            .get()
            .await
            .map_err(|e| CloneError::pool(e, "checking out clone session"))?;
        Ok(PostgresStore {
            client,
            schema: self.schema.clone(),
            returned_pks: HashMap::new(),
            returned_content: HashSet::new(),
            mapping: Vec::new(),
        })
    }
}

async fn introspect(client: &Object) -> Result<Schema> {
    let fk_rows = client
        .query(FOREIGN_KEY_QUERY, &[])
        .await
        .map_err(|e| CloneError::Schema(format!("foreign key introspection failed: {}", e)))?;
    let foreign_keys = fk_rows
        .iter()
        .map(|r| crate::core::ForeignKey {
            base_table: r.get(0),
            base_col: r.get(1),
            referencing_table: r.get(2),
            referencing_col: r.get(3),
        })
        .collect();

    let pk_rows = client
        .query(PRIMARY_KEY_QUERY, &[])
        .await
        .map_err(|e| CloneError::Schema(format!("primary key introspection failed: {}", e)))?;
    let mut primary_keys = BTreeMap::new();
    for r in &pk_rows {
        primary_keys.insert(r.get::<_, String>(0), r.get::<_, String>(1));
    }

    Ok(Schema::new(primary_keys, foreign_keys))
}

/// One clone session against PostgreSQL.
pub struct PostgresStore {
    client: Object,
    schema: Schema,
    /// Primary keys already handed out per table; excluded from later scans.
    returned_pks: HashMap<String, Vec<Value>>,
    /// Content keys of already-returned rows for tables without a key.
    returned_content: HashSet<String>,
    mapping: Vec<MappingEntry>,
}

impl PostgresStore {
    /// Open a transaction on this session's connection.
    pub async fn begin(&self) -> Result<()> {
        self.client.batch_execute("BEGIN").await?;
        Ok(())
    }

    /// Commit the open transaction.
    pub async fn commit(&self) -> Result<()> {
        self.client.batch_execute("COMMIT").await?;
        Ok(())
    }

    /// Roll the open transaction back.
    pub async fn rollback(&self) -> Result<()> {
        self.client.batch_execute("ROLLBACK").await?;
        Ok(())
    }

    async fn insert_row(&mut self, row: &mut Row) -> Result<()> {
        let table = row.table.clone();
        let pk = self.schema.primary_key(&table).map(ToString::to_string);

        let mut columns = Vec::new();
        let mut params: Vec<Value> = Vec::new();
        for (column, value) in &row.cells {
            if pk.as_deref() == Some(column.as_str()) {
                continue;
            }
            columns.push(column.clone());
            params.push(value.clone());
        }

        let mut sql = if columns.is_empty() {
            format!("INSERT INTO {} DEFAULT VALUES", quote_ident(&table))
        } else {
            let cols = columns
                .iter()
                .map(|c| quote_ident(c))
                .collect::<Vec<_>>()
                .join(", ");
            let placeholders = (1..=params.len())
                .map(|i| format!("${}", i))
                .collect::<Vec<_>>()
                .join(", ");
            format!(
                "INSERT INTO {} ({}) VALUES ({})",
                quote_ident(&table),
                cols,
                placeholders
            )
        };

        match pk {
            Some(pk) => {
                sql.push_str(&format!(" RETURNING {}", quote_ident(&pk)));
                let returned = self.client.query_one(&sql, &param_refs(&params)).await?;
                let new_id = decode_value(&returned, 0, returned.columns()[0].type_())?;
                let original = row.cells.get(&pk).cloned().unwrap_or(Value::Null);
                row.set(pk, new_id.clone());
                self.mapping.push(MappingEntry {
                    table,
                    original_id: original,
                    new_id,
                });
            }
            None => {
                self.client.execute(&sql, &param_refs(&params)).await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl RowStore for PostgresStore {
    fn schema(&self) -> &Schema {
        &self.schema
    }

    async fn select_matching_rows(
        &mut self,
        table: &str,
        conds: &BTreeMap<String, Vec<Value>>,
    ) -> Result<Vec<Row>> {
        let mut clauses = Vec::new();
        let mut params: Vec<Value> = Vec::new();
        for (column, values) in conds {
            for value in values {
                params.push(value.clone());
                clauses.push(format!("{} = ${}", quote_ident(column), params.len()));
            }
        }
        if clauses.is_empty() {
            return Ok(Vec::new());
        }

        let pk = self.schema.primary_key(table).map(ToString::to_string);
        let mut sql = format!(
            "SELECT * FROM {} WHERE ({})",
            quote_ident(table),
            clauses.join(" OR ")
        );
        if let Some(pk) = &pk {
            let seen = self.returned_pks.get(table).map_or(&[][..], Vec::as_slice);
            if !seen.is_empty() {
                let mut placeholders = Vec::with_capacity(seen.len());
                for value in seen {
                    params.push(value.clone());
                    placeholders.push(format!("${}", params.len()));
                }
                sql.push_str(&format!(
                    " AND {} NOT IN ({})",
                    quote_ident(pk),
                    placeholders.join(", ")
                ));
            }
        }

        let fetched = self.client.query(&sql, &param_refs(&params)).await?;

        let mut out = Vec::with_capacity(fetched.len());
        for pg_row in &fetched {
            let row = decode_row(table, pg_row)?;
            match &pk {
                Some(pk) => {
                    if let Some(key) = row.get(pk) {
                        self.returned_pks
                            .entry(table.to_string())
                            .or_default()
                            .push(key.clone());
                    }
                }
                None => {
                    // no key to dedup on: fall back to whole-row content
                    let content = content_key(&row);
                    if !self.returned_content.insert(content) {
                        continue;
                    }
                }
            }
            out.push(row);
        }
        Ok(out)
    }

    async fn insert(&mut self, rows: &mut [Row]) -> Result<()> {
        for row in rows {
            self.insert_row(row).await?;
        }
        Ok(())
    }

    async fn insert_record(&mut self, mut row: Row) -> Result<Value> {
        let pk = self.schema.primary_key(&row.table).map(ToString::to_string);
        self.insert_row(&mut row).await?;
        Ok(match pk {
            Some(pk) => row.cells.remove(&pk).unwrap_or(Value::Null),
            None => Value::Null,
        })
    }

    async fn update(&mut self, id: &RecordId, changes: &BTreeMap<String, Value>) -> Result<()> {
        let pk = self
            .schema
            .primary_key(&id.table)
            .ok_or_else(|| CloneError::Schema(format!("table {} has no primary key", id.table)))?
            .to_string();

        let mut sets = Vec::new();
        let mut params: Vec<Value> = Vec::new();
        for (column, value) in changes {
            if column == TABLE_KEY {
                continue;
            }
            params.push(value.clone());
            sets.push(format!("{} = ${}", quote_ident(column), params.len()));
        }
        if sets.is_empty() {
            return Ok(());
        }
        params.push(id.key.clone());

        let sql = format!(
            "UPDATE {} SET {} WHERE {} = ${}",
            quote_ident(&id.table),
            sets.join(", "),
            quote_ident(&pk),
            params.len()
        );
        let affected = self.client.execute(&sql, &param_refs(&params)).await?;
        if affected == 0 {
            return Err(CloneError::integrity(id, "update touched no rows"));
        }
        Ok(())
    }

    async fn delete(&mut self, id: &RecordId) -> Result<()> {
        let pk = self
            .schema
            .primary_key(&id.table)
            .ok_or_else(|| CloneError::Schema(format!("table {} has no primary key", id.table)))?
            .to_string();

        let sql = format!(
            "DELETE FROM {} WHERE {} = $1",
            quote_ident(&id.table),
            quote_ident(&pk)
        );
        let params = [id.key.clone()];
        let affected = self.client.execute(&sql, &param_refs(&params)).await?;
        if affected != 1 {
            return Err(CloneError::integrity(
                id,
                format!("delete touched {} rows", affected),
            ));
        }
        Ok(())
    }

    fn mapping(&self) -> &[MappingEntry] {
        &self.mapping
    }
}

/// Quote a PostgreSQL identifier.
fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn param_refs(params: &[Value]) -> Vec<&(dyn ToSql + Sync)> {
    params.iter().map(|p| p as &(dyn ToSql + Sync)).collect()
}

fn content_key(row: &Row) -> String {
    let mut key = row.table.clone();
    for (column, value) in &row.cells {
        key.push('|');
        key.push_str(column);
        key.push('=');
        key.push_str(&value.canon());
    }
    key
}

fn decode_row(table: &str, pg_row: &tokio_postgres::Row) -> Result<Row> {
    let mut row = Row::new(table);
    for (idx, column) in pg_row.columns().iter().enumerate() {
        let value = decode_value(pg_row, idx, column.type_())?;
        row.cells.insert(column.name().to_string(), value);
    }
    Ok(row)
}

fn decode_value(pg_row: &tokio_postgres::Row, idx: usize, ty: &Type) -> Result<Value> {
    let value = if *ty == Type::BOOL {
        pg_row
            .try_get::<_, Option<bool>>(idx)?
            .map_or(Value::Null, Value::Bool)
    } else if *ty == Type::INT2 {
        pg_row
            .try_get::<_, Option<i16>>(idx)?
            .map_or(Value::Null, |v| Value::Int(v as i64))
    } else if *ty == Type::INT4 {
        pg_row
            .try_get::<_, Option<i32>>(idx)?
            .map_or(Value::Null, |v| Value::Int(v as i64))
    } else if *ty == Type::INT8 {
        pg_row
            .try_get::<_, Option<i64>>(idx)?
            .map_or(Value::Null, Value::Int)
    } else if *ty == Type::FLOAT4 {
        pg_row
            .try_get::<_, Option<f32>>(idx)?
            .map_or(Value::Null, |v| Value::Float(v as f64))
    } else if *ty == Type::FLOAT8 {
        pg_row
            .try_get::<_, Option<f64>>(idx)?
            .map_or(Value::Null, Value::Float)
    } else if *ty == Type::NUMERIC {
        pg_row
            .try_get::<_, Option<Decimal>>(idx)?
            .map_or(Value::Null, Value::Decimal)
    } else if *ty == Type::TEXT || *ty == Type::VARCHAR || *ty == Type::BPCHAR || *ty == Type::NAME
    {
        pg_row
            .try_get::<_, Option<String>>(idx)?
            .map_or(Value::Null, Value::Text)
    } else if *ty == Type::UUID {
        pg_row
            .try_get::<_, Option<Uuid>>(idx)?
            .map_or(Value::Null, Value::Uuid)
    } else if *ty == Type::TIMESTAMP {
        pg_row
            .try_get::<_, Option<NaiveDateTime>>(idx)?
            .map_or(Value::Null, Value::Timestamp)
    } else if *ty == Type::TIMESTAMPTZ {
        pg_row
            .try_get::<_, Option<DateTime<FixedOffset>>>(idx)?
            .map_or(Value::Null, Value::TimestampTz)
    } else if *ty == Type::DATE {
        pg_row
            .try_get::<_, Option<NaiveDate>>(idx)?
            .map_or(Value::Null, Value::Date)
    } else if *ty == Type::TIME {
        pg_row
            .try_get::<_, Option<NaiveTime>>(idx)?
            .map_or(Value::Null, Value::Time)
    } else if *ty == Type::BYTEA {
        pg_row
            .try_get::<_, Option<Vec<u8>>>(idx)?
            .map_or(Value::Null, Value::Bytes)
    } else if *ty == Type::JSON || *ty == Type::JSONB {
        pg_row
            .try_get::<_, Option<serde_json::Value>>(idx)?
            .map_or(Value::Null, |v| Value::Text(v.to_string()))
    } else {
        // opaque type: take the textual form if the driver can give us one
        match pg_row.try_get::<_, Option<String>>(idx) {
            Ok(v) => v.map_or(Value::Null, Value::Text),
            Err(_) => {
                warn!(
                    "column {} has unsupported type {}; treating as NULL",
                    pg_row.columns()[idx].name(),
                    ty
                );
                Value::Null
            }
        }
    };
    Ok(value)
}

/// Dynamic parameter encoding.
///
/// Values that round-tripped through a JSON dump arrive as text even when
/// the column is numeric, temporal, or a UUID, so encoding coerces by the
/// column type the server declared rather than by the variant alone.
impl ToSql for Value {
    fn to_sql(
        &self,
        ty: &Type,
        out: &mut BytesMut,
    ) -> std::result::Result<IsNull, Box<dyn std::error::Error + Sync + Send>> {
        match self {
            Value::Null => Ok(IsNull::Yes),
            Value::Bool(b) => b.to_sql(ty, out),
            Value::Int(i) => {
                if *ty == Type::INT2 {
                    (*i as i16).to_sql(ty, out)
                } else if *ty == Type::INT4 {
                    (*i as i32).to_sql(ty, out)
                } else if *ty == Type::FLOAT4 {
                    (*i as f32).to_sql(ty, out)
                } else if *ty == Type::FLOAT8 {
                    (*i as f64).to_sql(ty, out)
                } else if *ty == Type::NUMERIC {
                    Decimal::from(*i).to_sql(ty, out)
                } else if is_textual(ty) {
                    i.to_string().to_sql(ty, out)
                } else {
                    i.to_sql(ty, out)
                }
            }
            Value::Float(f) => {
                if *ty == Type::FLOAT4 {
                    (*f as f32).to_sql(ty, out)
                } else if *ty == Type::INT2 {
                    (*f as i16).to_sql(ty, out)
                } else if *ty == Type::INT4 {
                    (*f as i32).to_sql(ty, out)
                } else if *ty == Type::INT8 {
                    (*f as i64).to_sql(ty, out)
                } else if *ty == Type::NUMERIC {
                    Decimal::try_from(*f)?.to_sql(ty, out)
                } else {
                    f.to_sql(ty, out)
                }
            }
            Value::Decimal(d) => d.to_sql(ty, out),
            Value::Text(s) => {
                if *ty == Type::INT2 {
                    s.trim().parse::<i16>()?.to_sql(ty, out)
                } else if *ty == Type::INT4 {
                    s.trim().parse::<i32>()?.to_sql(ty, out)
                } else if *ty == Type::INT8 {
                    s.trim().parse::<i64>()?.to_sql(ty, out)
                } else if *ty == Type::FLOAT4 {
                    s.trim().parse::<f32>()?.to_sql(ty, out)
                } else if *ty == Type::FLOAT8 {
                    s.trim().parse::<f64>()?.to_sql(ty, out)
                } else if *ty == Type::BOOL {
                    s.trim().parse::<bool>()?.to_sql(ty, out)
                } else if *ty == Type::NUMERIC {
                    s.trim().parse::<Decimal>()?.to_sql(ty, out)
                } else if *ty == Type::UUID {
                    Uuid::parse_str(s.trim())?.to_sql(ty, out)
                } else if *ty == Type::TIMESTAMP {
                    parse_timestamp(s)?.to_sql(ty, out)
                } else if *ty == Type::TIMESTAMPTZ {
                    DateTime::parse_from_rfc3339(s.trim())?.to_sql(ty, out)
                } else if *ty == Type::DATE {
                    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")?.to_sql(ty, out)
                } else if *ty == Type::TIME {
                    NaiveTime::parse_from_str(s.trim(), "%H:%M:%S%.f")?.to_sql(ty, out)
                } else if *ty == Type::BYTEA {
                    parse_hex(s)?.to_sql(ty, out)
                } else {
                    s.to_sql(ty, out)
                }
            }
            Value::Uuid(u) => u.to_sql(ty, out),
            Value::Timestamp(t) => t.to_sql(ty, out),
            Value::TimestampTz(t) => t.to_sql(ty, out),
            Value::Date(d) => d.to_sql(ty, out),
            Value::Time(t) => t.to_sql(ty, out),
            Value::Bytes(b) => b.to_sql(ty, out),
        }
    }

    fn accepts(_ty: &Type) -> bool {
        // dynamic: every coercion failure surfaces at encode time instead
        true
    }

    to_sql_checked!();
}

fn is_textual(ty: &Type) -> bool {
    *ty == Type::TEXT || *ty == Type::VARCHAR || *ty == Type::BPCHAR || *ty == Type::NAME
}

fn parse_timestamp(s: &str) -> std::result::Result<NaiveDateTime, chrono::ParseError> {
    let s = s.trim();
    NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f"))
}

fn parse_hex(s: &str) -> std::result::Result<Vec<u8>, Box<dyn std::error::Error + Sync + Send>> {
    let digits = s.strip_prefix("\\x").unwrap_or(s);
    if digits.len() % 2 != 0 {
        return Err(format!("odd-length hex string: {}", s).into());
    }
    let mut out = Vec::with_capacity(digits.len() / 2);
    for i in (0..digits.len()).step_by(2) {
        let byte = u8::from_str_radix(&digits[i..i + 2], 16)
            .map_err(|e| format!("bad hex string {}: {}", s, e))?;
        out.push(byte);
    }
    Ok(out)
}
