// Metric catalog - known metric names plus the current selection

/// Immutable copy of the catalog handed to observers
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CatalogSnapshot {
    pub names: Vec<String>,
    pub selected: String,
}

#[derive(Debug, Clone, Default)]
pub struct MetricCatalog {
    names: Vec<String>,
    selected: String,
}

impl MetricCatalog {
    pub fn new(selected: impl Into<String>) -> Self {
        Self {
            names: Vec::new(),
            selected: selected.into(),
        }
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn selected(&self) -> &str {
        &self.selected
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.iter().any(|n| n == name)
    }

    /// Selection is optimistic: membership is only enforced by the next
    /// `replace_names`.
    pub fn select(&mut self, name: impl Into<String>) {
        self.selected = name.into();
    }

    /// Install a freshly fetched name list and re-establish the selection
    /// invariant. Order is preserved, later duplicates are dropped.
    /// Returns true when the selection changed.
    pub fn replace_names(&mut self, names: Vec<String>) -> bool {
        let mut unique: Vec<String> = Vec::with_capacity(names.len());
        for name in names {
            if !unique.contains(&name) {
                unique.push(name);
            }
        }
        self.names = unique;

        if self.contains(&self.selected) {
            return false;
        }

        let previous = std::mem::take(&mut self.selected);
        self.selected = self.names.first().cloned().unwrap_or_default();
        if previous == self.selected {
            return false;
        }

        tracing::info!(
            previous = %previous,
            selected = %self.selected,
            "Selected metric no longer in catalog, reselecting"
        );
        true
    }

    pub fn snapshot(&self) -> CatalogSnapshot {
        CatalogSnapshot {
            names: self.names.clone(),
            selected: self.selected.clone(),
        }
    }
}
