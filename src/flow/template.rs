//! Per-exporter template tables.
//!
//! Lookups take the outer map read lock and then the exporter's own lock; a
//! registration only takes the exporter's lock for writing, except the first time an
//! exporter is seen.

use crate::error::TemplateError;
use crate::flow::record::ExporterId;
use parking_lot::RwLock;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::debug;

/// Lowest identifier usable by a template; smaller values name set types.
pub const MIN_TEMPLATE_ID: u16 = 256;

/// IPFIX marker for a variable-length field.
pub const VARIABLE_LENGTH: u16 = 0xFFFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSpec {
    pub field_type: u16,
    pub length: u16,
    /// IPFIX private enterprise number, when the enterprise bit was set.
    pub enterprise: Option<u32>,
}

impl FieldSpec {
    pub fn new(field_type: u16, length: u16) -> Self {
        Self {
            field_type,
            length,
            enterprise: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplateKind {
    Data,
    /// Options data describes the exporter itself and is never sketched.
    Options { scope_fields: u16 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    pub id: u16,
    pub kind: TemplateKind,
    pub fields: Vec<FieldSpec>,
    record_len: usize,
}

impl Template {
    pub fn new(id: u16, kind: TemplateKind, fields: Vec<FieldSpec>) -> Result<Self, TemplateError> {
        if id < MIN_TEMPLATE_ID {
            return Err(TemplateError::ReservedId(id));
        }
        if fields.is_empty() {
            return Err(TemplateError::NoFields { template_id: id });
        }
        let mut record_len = 0usize;
        for f in &fields {
            match f.length {
                0 => {
                    return Err(TemplateError::ZeroLengthField {
                        template_id: id,
                        field_type: f.field_type,
                    })
                }
                VARIABLE_LENGTH => {
                    return Err(TemplateError::VariableLengthField {
                        template_id: id,
                        field_type: f.field_type,
                    })
                }
                len => record_len += usize::from(len),
            }
        }
        Ok(Self {
            id,
            kind,
            fields,
            record_len,
        })
    }

    /// Fixed byte width of one data record.
    pub fn record_len(&self) -> usize {
        self.record_len
    }

    pub fn is_options(&self) -> bool {
        matches!(self.kind, TemplateKind::Options { .. })
    }
}

#[derive(Default)]
struct ExporterTemplates {
    templates: HashMap<u16, Arc<Template>>,
    /// Registration order, oldest first.
    order: VecDeque<u16>,
}

pub struct TemplateManager {
    max_per_exporter: usize,
    exporters: RwLock<HashMap<ExporterId, Arc<RwLock<ExporterTemplates>>>>,
}

impl TemplateManager {
    pub fn new(max_per_exporter: usize) -> Self {
        Self {
            max_per_exporter: max_per_exporter.max(1),
            exporters: RwLock::new(HashMap::new()),
        }
    }

    /// Register a data template, replacing any previous definition of the same id.
    pub fn register_template(
        &self,
        exporter: ExporterId,
        template_id: u16,
        fields: Vec<FieldSpec>,
    ) -> Result<Arc<Template>, TemplateError> {
        let template = Template::new(template_id, TemplateKind::Data, fields)?;
        Ok(self.insert(exporter, template))
    }

    pub fn register_options_template(
        &self,
        exporter: ExporterId,
        template_id: u16,
        scope_fields: u16,
        fields: Vec<FieldSpec>,
    ) -> Result<Arc<Template>, TemplateError> {
        let template = Template::new(template_id, TemplateKind::Options { scope_fields }, fields)?;
        Ok(self.insert(exporter, template))
    }

    /// Store a validated template. Evicts the least-recently-registered template of
    /// this exporter once the cap is exceeded.
    pub fn insert(&self, exporter: ExporterId, template: Template) -> Arc<Template> {
        let table = self.table_for(exporter);
        let mut t = table.write();
        let id = template.id;
        let template = Arc::new(template);
        if t.templates.insert(id, Arc::clone(&template)).is_some() {
            t.order.retain(|existing| *existing != id);
        }
        t.order.push_back(id);
        while t.order.len() > self.max_per_exporter {
            if let Some(oldest) = t.order.pop_front() {
                t.templates.remove(&oldest);
                debug!(exporter = %exporter, template_id = oldest, "template evicted");
            }
        }
        template
    }

    pub fn get_template(&self, exporter: ExporterId, template_id: u16) -> Option<Arc<Template>> {
        let table = self.exporters.read().get(&exporter).cloned()?;
        let t = table.read();
        t.templates.get(&template_id).cloned()
    }

    /// IPFIX template withdrawal. Returns whether the template existed.
    pub fn withdraw(&self, exporter: ExporterId, template_id: u16) -> bool {
        let Some(table) = self.exporters.read().get(&exporter).cloned() else {
            return false;
        };
        let mut t = table.write();
        let existed = t.templates.remove(&template_id).is_some();
        if existed {
            t.order.retain(|id| *id != template_id);
        }
        existed
    }

    /// Withdraw every data template, or every options template, of one exporter.
    /// Returns how many were dropped.
    pub fn withdraw_all(&self, exporter: ExporterId, options: bool) -> usize {
        let Some(table) = self.exporters.read().get(&exporter).cloned() else {
            return 0;
        };
        let mut t = table.write();
        let ExporterTemplates { templates, order } = &mut *t;
        let before = templates.len();
        templates.retain(|_, template| template.is_options() != options);
        order.retain(|id| templates.contains_key(id));
        before - templates.len()
    }

    /// Forget every template of one exporter. Returns how many were dropped.
    pub fn evict_for(&self, exporter: ExporterId) -> usize {
        self.exporters
            .write()
            .remove(&exporter)
            .map(|table| table.read().templates.len())
            .unwrap_or(0)
    }

    pub fn template_count(&self, exporter: ExporterId) -> usize {
        self.exporters
            .read()
            .get(&exporter)
            .map(|table| table.read().templates.len())
            .unwrap_or(0)
    }

    pub fn exporter_count(&self) -> usize {
        self.exporters.read().len()
    }

    fn table_for(&self, exporter: ExporterId) -> Arc<RwLock<ExporterTemplates>> {
        if let Some(table) = self.exporters.read().get(&exporter) {
            return Arc::clone(table);
        }
        let mut all = self.exporters.write();
        Arc::clone(all.entry(exporter).or_default())
    }
}
