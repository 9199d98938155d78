use chrono::{DateTime, Utc};
use std::collections::HashMap;

/// Identifier columns that are not model features.
pub const TIMESTAMP_COLUMN: &str = "timestamp";
pub const USER_COLUMN: &str = "user_id";
pub const LABEL_COLUMN: &str = "is_sleeping";

/// One aggregated bin for one user. `values` follow the owning table's
/// column list.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureWindow {
    pub user_id: String,
    pub timestamp: DateTime<Utc>,
    pub is_sleeping: bool,
    pub values: Vec<Option<f64>>,
}

/// Feature rows of a single user.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureTable {
    pub user_id: String,
    pub columns: Vec<String>,
    pub rows: Vec<FeatureWindow>,
}

impl FeatureTable {
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn timestamps(&self) -> Vec<DateTime<Utc>> {
        self.rows.iter().map(|r| r.timestamp).collect()
    }

    pub fn labels(&self) -> Vec<bool> {
        self.rows.iter().map(|r| r.is_sleeping).collect()
    }
}

/// All users' feature rows over the union of their columns.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Dataset {
    pub columns: Vec<String>,
    pub rows: Vec<FeatureWindow>,
}

/// Model-ready view: features only, complete rows only.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureMatrix {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<f64>>,
    pub labels: Vec<bool>,
    /// Rows left out because some feature was missing.
    pub dropped: usize,
}

impl Dataset {
    /// Concatenates tables in the given order. Columns are the union of all
    /// tables' columns in first-seen order; cells a table lacks are missing.
    pub fn concat(tables: Vec<FeatureTable>) -> Dataset {
        let mut columns: Vec<String> = Vec::new();
        let mut position: HashMap<String, usize> = HashMap::new();
        for table in &tables {
            for column in &table.columns {
                if !position.contains_key(column) {
                    position.insert(column.clone(), columns.len());
                    columns.push(column.clone());
                }
            }
        }

        let mut rows = Vec::with_capacity(tables.iter().map(|t| t.rows.len()).sum());
        for table in tables {
            let slots: Vec<usize> = table.columns.iter().map(|c| position[c]).collect();
            for row in table.rows {
                let mut values = vec![None; columns.len()];
                for (slot, value) in slots.iter().zip(row.values) {
                    values[*slot] = value;
                }
                rows.push(FeatureWindow { values, ..row });
            }
        }

        Dataset { columns, rows }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    pub fn user_ids(&self) -> Vec<&str> {
        let mut users: Vec<&str> = Vec::new();
        for row in &self.rows {
            if users.last() != Some(&row.user_id.as_str()) {
                users.push(&row.user_id);
            }
        }
        users
    }

    /// Drops timestamp, user id and label, and discards rows with any
    /// missing feature.
    pub fn feature_matrix(&self) -> FeatureMatrix {
        let mut rows = Vec::with_capacity(self.rows.len());
        let mut labels = Vec::with_capacity(self.rows.len());
        for row in &self.rows {
            if let Some(values) = row.values.iter().copied().collect::<Option<Vec<f64>>>() {
                rows.push(values);
                labels.push(row.is_sleeping);
            }
        }
        FeatureMatrix {
            columns: self.columns.clone(),
            dropped: self.rows.len() - rows.len(),
            rows,
            labels,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn table(user: &str, columns: &[&str], rows: Vec<Vec<Option<f64>>>) -> FeatureTable {
        FeatureTable {
            user_id: user.to_string(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
            rows: rows
                .into_iter()
                .enumerate()
                .map(|(i, values)| FeatureWindow {
                    user_id: user.to_string(),
                    timestamp: DateTime::from_timestamp(60 * i as i64, 0).unwrap(),
                    is_sleeping: i % 2 == 0,
                    values,
                })
                .collect(),
        }
    }

    #[test]
    fn concat_keeps_user_order_and_unions_columns() {
        let a = table("user_2", &["hr_mean", "steps_sum"], vec![vec![Some(60.0), Some(3.0)]]);
        let b = table(
            "user_1",
            &["steps_sum", "vm_roll_mean_300s_mean"],
            vec![vec![Some(1.0), Some(0.5)], vec![None, Some(0.7)]],
        );

        let dataset = Dataset::concat(vec![a, b]);
        assert_eq!(dataset.columns, vec!["hr_mean", "steps_sum", "vm_roll_mean_300s_mean"]);
        assert_eq!(dataset.user_ids(), vec!["user_2", "user_1"]);
        assert_eq!(dataset.rows[0].values, vec![Some(60.0), Some(3.0), None]);
        assert_eq!(dataset.rows[1].values, vec![None, Some(1.0), Some(0.5)]);
        assert_eq!(dataset.rows[2].values, vec![None, None, Some(0.7)]);
    }

    #[test]
    fn feature_matrix_drops_incomplete_rows() {
        let dataset = Dataset::concat(vec![table(
            "user_1",
            &["hr_mean", "hr_std"],
            vec![
                vec![Some(60.0), Some(1.0)],
                vec![Some(61.0), None],
                vec![Some(62.0), Some(2.0)],
            ],
        )]);

        let matrix = dataset.feature_matrix();
        assert_eq!(matrix.rows, vec![vec![60.0, 1.0], vec![62.0, 2.0]]);
        assert_eq!(matrix.labels, vec![true, true]);
        assert_eq!(matrix.dropped, 1);
        assert!(!matrix.columns.iter().any(|c| c == LABEL_COLUMN));
    }
}
