//! SQL text builder for upsert-by-primary-key statements.

/// Column layout of one table, used to build its upsert statement.
pub struct TableColumns {
    pub table: &'static str,
    pub key_columns: &'static [&'static str],
    pub data_columns: &'static [&'static str],
}

impl TableColumns {
    /// Build `INSERT … ON CONFLICT(pk) DO UPDATE SET col = excluded.col`.
    ///
    /// With no data columns the conflict clause degrades to `DO NOTHING`
    /// (nothing to update, the row is already identical by key).
    pub fn upsert_sql(&self) -> String {
        let all: Vec<&str> = self
            .key_columns
            .iter()
            .chain(self.data_columns.iter())
            .copied()
            .collect();
        let placeholders = vec!["?"; all.len()].join(", ");

        let conflict = if self.data_columns.is_empty() {
            "DO NOTHING".to_owned()
        } else {
            let updates = self
                .data_columns
                .iter()
                .map(|c| format!("{c} = excluded.{c}"))
                .collect::<Vec<_>>()
                .join(", ");
            format!("DO UPDATE SET {updates}")
        };

        format!(
            "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT ({}) {}",
            self.table,
            all.join(", "),
            placeholders,
            self.key_columns.join(", "),
            conflict
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_update_clause_for_data_columns() {
        let table = TableColumns {
            table: "users",
            key_columns: &["id"],
            data_columns: &["name", "avatar_url"],
        };
        assert_eq!(
            table.upsert_sql(),
            "INSERT INTO users (id, name, avatar_url) VALUES (?, ?, ?) \
             ON CONFLICT (id) DO UPDATE SET name = excluded.name, \
             avatar_url = excluded.avatar_url"
        );
    }

    #[test]
    fn degrades_to_do_nothing_without_data_columns() {
        let table = TableColumns {
            table: "seen",
            key_columns: &["id"],
            data_columns: &[],
        };
        assert_eq!(
            table.upsert_sql(),
            "INSERT INTO seen (id) VALUES (?) ON CONFLICT (id) DO NOTHING"
        );
    }

    #[test]
    fn supports_composite_keys() {
        let table = TableColumns {
            table: "poll_answers",
            key_columns: &["message_id", "answer_id"],
            data_columns: &["text"],
        };
        let sql = table.upsert_sql();
        assert!(sql.contains("ON CONFLICT (message_id, answer_id)"));
        assert!(sql.starts_with("INSERT INTO poll_answers (message_id, answer_id, text)"));
    }
}
