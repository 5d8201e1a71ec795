//! The compiled execution plan.
//!
//! A plan is an ordered list of pipeline stages, each a `$`-named step with
//! a BSON body. It is the only thing that crosses from the compiler to the
//! driver.

use bson::{doc, Bson, Document};

#[derive(Clone, Debug, PartialEq)]
pub struct PlanStage {
    /// Backend stage name, `$`-prefixed (`$match`, `$group`, ...).
    pub name: &'static str,
    pub body: Bson,
}

impl PlanStage {
    pub fn new(name: &'static str, body: impl Into<Bson>) -> Self {
        PlanStage {
            name,
            body: body.into(),
        }
    }

    pub fn into_document(self) -> Document {
        doc! { self.name: self.body }
    }
}

/// An ordered aggregation pipeline plus any degradations recorded while
/// lowering best-effort constructs. Degraded plans still execute; the notes
/// exist so callers can surface what was weakened.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Pipeline {
    stages: Vec<PlanStage>,
    degradations: Vec<String>,
}

impl Pipeline {
    pub fn new() -> Self {
        Pipeline::default()
    }

    pub fn push(&mut self, stage: PlanStage) {
        self.stages.push(stage);
    }

    pub fn record_degradation(&mut self, note: impl Into<String>) {
        self.degradations.push(note.into());
    }

    pub fn stages(&self) -> &[PlanStage] {
        &self.stages
    }

    pub fn degradations(&self) -> &[String] {
        &self.degradations
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// The array-of-single-key-documents form `aggregate` consumes.
    pub fn into_documents(self) -> Vec<Document> {
        self.stages
            .into_iter()
            .map(PlanStage::into_document)
            .collect()
    }
}
