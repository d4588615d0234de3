use crate::error::PrecisionError;
use ahash::AHashMap;
use serde::{Deserialize, Serialize};

/// Row-aligned metadata for one row of a block's precision matrix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariantRecord {
    pub site_id: String,
    pub chromosome: u8,
    pub position: u64,
    pub ref_allele: String,
    pub alt_allele: String,
}

/// A named numeric column carried alongside the variant records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NumericColumn {
    pub name: String,
    pub values: Vec<f64>,
}

/// The ordered per-row records of one block. Row `i` describes matrix row `i`.
#[derive(Debug, Clone, Default)]
pub struct VariantTable {
    records: Vec<VariantRecord>,
    columns: Vec<NumericColumn>,
    by_site_id: AHashMap<String, usize>,
}

impl VariantTable {
    pub fn new(records: Vec<VariantRecord>) -> Self {
        let mut by_site_id = AHashMap::with_capacity(records.len());
        for (row, record) in records.iter().enumerate() {
            // The first row carrying an identifier wins lookups.
            by_site_id.entry(record.site_id.clone()).or_insert(row);
        }
        Self {
            records,
            columns: Vec::new(),
            by_site_id,
        }
    }

    /// Attaches an extra numeric column. Its length must match the row count.
    pub fn with_column(
        mut self,
        name: impl Into<String>,
        values: Vec<f64>,
    ) -> Result<Self, PrecisionError> {
        let name = name.into();
        if values.len() != self.records.len() {
            return Err(PrecisionError::InvalidVariantTable(format!(
                "column '{name}' has {} values for {} variants",
                values.len(),
                self.records.len()
            )));
        }
        if self.columns.iter().any(|column| column.name == name) {
            return Err(PrecisionError::InvalidVariantTable(format!(
                "column '{name}' is defined twice"
            )));
        }
        self.columns.push(NumericColumn { name, values });
        Ok(self)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, row: usize) -> Option<&VariantRecord> {
        self.records.get(row)
    }

    pub fn records(&self) -> &[VariantRecord] {
        &self.records
    }

    pub fn column(&self, name: &str) -> Option<&[f64]> {
        self.columns
            .iter()
            .find(|column| column.name == name)
            .map(|column| column.values.as_slice())
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|column| column.name.as_str())
    }

    pub fn index_of(&self, site_id: &str) -> Option<usize> {
        self.by_site_id.get(site_id).copied()
    }

    /// Builds the table of `rows`, in the given order, keeping every column.
    pub fn select(&self, rows: &[usize]) -> Result<Self, PrecisionError> {
        if let Some(&row) = rows.iter().find(|&&row| row >= self.records.len()) {
            return Err(PrecisionError::InvalidVariantTable(format!(
                "row {row} is out of range for {} variants",
                self.records.len()
            )));
        }
        let records = rows.iter().map(|&row| self.records[row].clone()).collect();
        let mut table = Self::new(records);
        table.columns = self
            .columns
            .iter()
            .map(|column| NumericColumn {
                name: column.name.clone(),
                values: rows.iter().map(|&row| column.values[row]).collect(),
            })
            .collect();
        Ok(table)
    }
}
