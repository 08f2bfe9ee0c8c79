// vendas-core/src/aggregation.rs
// Aggregation pipeline implementation

use crate::error::{Result, VendasError};
use crate::value_utils::{
    canonical_json_string, compare_values, compare_values_with_none, field_path,
    get_nested_value, remove_nested_value, set_nested_value, type_name,
};
use serde_json::{json, Map, Value};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::debug;

// ============================================================================
// HELPER FUNCTIONS
// ============================================================================

/// Parse a field reference from JSON value (e.g., "$nome_produto" -> "nome_produto")
fn parse_field_reference(value: &Value, op_name: &str) -> Result<String> {
    match value.as_str() {
        Some(s) => field_path(s).map(str::to_string).ok_or_else(|| {
            VendasError::AggregationError(format!(
                "{} field reference must start with $",
                op_name
            ))
        }),
        None => Err(VendasError::AggregationError(format!(
            "{} must be a field reference",
            op_name
        ))),
    }
}

fn reference(path: &str) -> Value {
    Value::String(format!("${}", path))
}

/// Pick the smallest (or largest) comparable, non-null value of a field
fn compute_extremum(docs: &[Value], field: &str, wanted: Ordering) -> Value {
    let mut best: Option<&Value> = None;

    for doc in docs {
        let Some(value) = get_nested_value(doc, field).filter(|v| !v.is_null()) else {
            continue;
        };
        best = match best {
            Some(current) if compare_values(value, current) != Some(wanted) => Some(current),
            _ => Some(value),
        };
    }

    best.cloned().unwrap_or(Value::Null)
}

// ============================================================================
// TYPES
// ============================================================================

/// Aggregation pipeline: an ordered sequence of stages
#[derive(Debug, Clone, PartialEq)]
pub struct Pipeline {
    stages: Vec<Stage>,
}

/// Pipeline stage
#[derive(Debug, Clone, PartialEq)]
pub enum Stage {
    Unwind(UnwindStage),
    Group(GroupStage),
    Project(ProjectStage),
    Sort(SortStage),
    Limit(LimitStage),
    Skip(SkipStage),
}

/// $unwind stage - one output row per element of an array field
#[derive(Debug, Clone, PartialEq)]
pub struct UnwindStage {
    path: String,
    preserve_null_and_empty_arrays: bool,
    include_array_index: Option<String>,
}

/// $group stage - group documents and compute aggregates
#[derive(Debug, Clone, PartialEq)]
pub struct GroupStage {
    id: GroupId,
    accumulators: BTreeMap<String, Accumulator>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum GroupId {
    Field(String), // "$compras.nome_produto"
    Null,          // null (all documents in one group)
}

#[derive(Debug, Clone, PartialEq)]
pub enum Accumulator {
    Sum(SumExpression),
    Avg(String),
    Min(String),
    Max(String),
    First(String),
    Last(String),
    Push(String),
    AddToSet(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum SumExpression {
    Constant(i64), // {"$sum": 1} - count
    Field(String), // {"$sum": "$valor"} - sum field values
}

/// $project stage - reshape documents
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProjectStage {
    fields: BTreeMap<String, ProjectField>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProjectField {
    Include,        // 1
    Exclude,        // 0
    Rename(String), // "$fieldName", stored without the $
}

/// $sort stage - sort documents
#[derive(Debug, Clone, PartialEq)]
pub struct SortStage {
    fields: Vec<(String, SortDirection)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Ascending,
    Descending,
}

/// $limit stage - limit number of documents
#[derive(Debug, Clone, PartialEq)]
pub struct LimitStage {
    limit: usize,
}

/// $skip stage - skip documents
#[derive(Debug, Clone, PartialEq)]
pub struct SkipStage {
    skip: usize,
}

// ============================================================================
// PIPELINE
// ============================================================================

impl Pipeline {
    /// Start a typed pipeline definition
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::default()
    }

    /// Create pipeline from JSON array
    pub fn from_json(pipeline_json: &Value) -> Result<Self> {
        let Value::Array(stages_array) = pipeline_json else {
            return Err(VendasError::AggregationError(
                "Pipeline must be an array".to_string(),
            ));
        };

        if stages_array.is_empty() {
            return Err(VendasError::AggregationError(
                "Pipeline cannot be empty".to_string(),
            ));
        }

        let stages = stages_array
            .iter()
            .map(Stage::from_json)
            .collect::<Result<Vec<_>>>()?;

        Ok(Pipeline { stages })
    }

    /// Render the pipeline back to its JSON array form
    pub fn to_json(&self) -> Value {
        Value::Array(self.stages.iter().map(Stage::to_json).collect())
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    /// Execute pipeline on documents
    pub fn execute(&self, mut docs: Vec<Value>) -> Result<Vec<Value>> {
        for stage in &self.stages {
            let rows_in = docs.len();
            docs = stage.execute(docs)?;
            debug!(stage = stage.name(), rows_in, rows_out = docs.len(), "stage done");
        }
        Ok(docs)
    }
}

/// Typed construction of a [`Pipeline`], stage by stage
#[derive(Debug, Default)]
pub struct PipelineBuilder {
    stages: Vec<Stage>,
}

impl PipelineBuilder {
    /// `{$unwind: "$path"}`
    pub fn unwind(self, path: &str) -> Self {
        self.stage(Stage::Unwind(UnwindStage::new(path)))
    }

    pub fn unwind_with(self, stage: UnwindStage) -> Self {
        self.stage(Stage::Unwind(stage))
    }

    pub fn group(self, stage: GroupStage) -> Self {
        self.stage(Stage::Group(stage))
    }

    pub fn project(self, stage: ProjectStage) -> Self {
        self.stage(Stage::Project(stage))
    }

    pub fn sort(self, field: &str, direction: SortDirection) -> Self {
        self.stage(Stage::Sort(SortStage {
            fields: vec![(field.to_string(), direction)],
        }))
    }

    pub fn limit(self, limit: usize) -> Self {
        self.stage(Stage::Limit(LimitStage { limit }))
    }

    pub fn skip(self, skip: usize) -> Self {
        self.stage(Stage::Skip(SkipStage { skip }))
    }

    pub fn stage(mut self, stage: Stage) -> Self {
        self.stages.push(stage);
        self
    }

    /// Finish the pipeline; an empty one passes documents through unchanged
    pub fn build(self) -> Pipeline {
        Pipeline {
            stages: self.stages,
        }
    }
}

impl Stage {
    /// Parse stage from JSON
    fn from_json(stage_json: &Value) -> Result<Self> {
        let Value::Object(obj) = stage_json else {
            return Err(VendasError::AggregationError(
                "Stage must be an object".to_string(),
            ));
        };

        // Each stage should have exactly one key
        let (stage_name, stage_spec) = match obj.iter().next() {
            Some(entry) if obj.len() == 1 => entry,
            _ => {
                return Err(VendasError::AggregationError(
                    "Each stage must have exactly one operator".to_string(),
                ))
            }
        };

        match stage_name.as_str() {
            "$unwind" => Ok(Stage::Unwind(UnwindStage::from_json(stage_spec)?)),
            "$group" => Ok(Stage::Group(GroupStage::from_json(stage_spec)?)),
            "$project" => Ok(Stage::Project(ProjectStage::from_json(stage_spec)?)),
            "$sort" => Ok(Stage::Sort(SortStage::from_json(stage_spec)?)),
            "$limit" => Ok(Stage::Limit(LimitStage::from_json(stage_spec)?)),
            "$skip" => Ok(Stage::Skip(SkipStage::from_json(stage_spec)?)),
            _ => Err(VendasError::AggregationError(format!(
                "Unknown pipeline stage: {}",
                stage_name
            ))),
        }
    }

    fn to_json(&self) -> Value {
        let (name, spec) = match self {
            Stage::Unwind(stage) => ("$unwind", stage.to_json()),
            Stage::Group(stage) => ("$group", stage.to_json()),
            Stage::Project(stage) => ("$project", stage.to_json()),
            Stage::Sort(stage) => ("$sort", stage.to_json()),
            Stage::Limit(stage) => ("$limit", Value::from(stage.limit)),
            Stage::Skip(stage) => ("$skip", Value::from(stage.skip)),
        };
        let mut obj = Map::new();
        obj.insert(name.to_string(), spec);
        Value::Object(obj)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Stage::Unwind(_) => "$unwind",
            Stage::Group(_) => "$group",
            Stage::Project(_) => "$project",
            Stage::Sort(_) => "$sort",
            Stage::Limit(_) => "$limit",
            Stage::Skip(_) => "$skip",
        }
    }

    /// Execute this stage
    fn execute(&self, docs: Vec<Value>) -> Result<Vec<Value>> {
        match self {
            Stage::Unwind(stage) => stage.execute(docs),
            Stage::Group(stage) => stage.execute(docs),
            Stage::Project(stage) => stage.execute(docs),
            Stage::Sort(stage) => stage.execute(docs),
            Stage::Limit(stage) => stage.execute(docs),
            Stage::Skip(stage) => stage.execute(docs),
        }
    }
}

// ============================================================================
// $unwind
// ============================================================================

impl UnwindStage {
    /// Accepts "$compras" or "compras"
    pub fn new(path: &str) -> Self {
        UnwindStage {
            path: field_path(path).unwrap_or(path).to_string(),
            preserve_null_and_empty_arrays: false,
            include_array_index: None,
        }
    }

    pub fn preserve_null_and_empty_arrays(mut self, preserve: bool) -> Self {
        self.preserve_null_and_empty_arrays = preserve;
        self
    }

    pub fn include_array_index(mut self, field: &str) -> Self {
        self.include_array_index = Some(field.to_string());
        self
    }

    fn from_json(spec: &Value) -> Result<Self> {
        match spec {
            Value::String(_) => Ok(UnwindStage::new(&parse_field_reference(spec, "$unwind")?)),
            Value::Object(obj) => {
                let path = obj.get("path").ok_or_else(|| {
                    VendasError::AggregationError("$unwind requires a path".to_string())
                })?;
                let mut stage = UnwindStage::new(&parse_field_reference(path, "$unwind path")?);

                for (option, value) in obj {
                    match option.as_str() {
                        "path" => {}
                        "preserveNullAndEmptyArrays" => {
                            stage.preserve_null_and_empty_arrays =
                                value.as_bool().ok_or_else(|| {
                                    VendasError::AggregationError(
                                        "preserveNullAndEmptyArrays must be a boolean"
                                            .to_string(),
                                    )
                                })?;
                        }
                        "includeArrayIndex" => match value.as_str() {
                            Some(field) if !field.is_empty() && !field.starts_with('$') => {
                                stage.include_array_index = Some(field.to_string());
                            }
                            _ => {
                                return Err(VendasError::AggregationError(
                                    "includeArrayIndex must be a field name without $"
                                        .to_string(),
                                ))
                            }
                        },
                        _ => {
                            return Err(VendasError::AggregationError(format!(
                                "Unknown $unwind option: {}",
                                option
                            )))
                        }
                    }
                }
                Ok(stage)
            }
            _ => Err(VendasError::AggregationError(
                "$unwind must be a field reference or an object".to_string(),
            )),
        }
    }

    fn to_json(&self) -> Value {
        if !self.preserve_null_and_empty_arrays && self.include_array_index.is_none() {
            return reference(&self.path);
        }
        let mut obj = Map::new();
        obj.insert("path".to_string(), reference(&self.path));
        if self.preserve_null_and_empty_arrays {
            obj.insert("preserveNullAndEmptyArrays".to_string(), Value::Bool(true));
        }
        if let Some(field) = &self.include_array_index {
            obj.insert("includeArrayIndex".to_string(), Value::from(field.as_str()));
        }
        Value::Object(obj)
    }

    fn execute(&self, docs: Vec<Value>) -> Result<Vec<Value>> {
        let mut results = Vec::new();

        for mut doc in docs {
            let items = match get_nested_value(&doc, &self.path) {
                None | Some(Value::Null) => None,
                Some(Value::Array(items)) => Some(items.clone()),
                Some(other) => {
                    return Err(VendasError::QueryExecution(format!(
                        "$unwind: field '{}' must be an array, found {}",
                        self.path,
                        type_name(other)
                    )))
                }
            };

            let items = match items {
                Some(items) if items.is_empty() => {
                    if self.preserve_null_and_empty_arrays {
                        remove_nested_value(&mut doc, &self.path);
                    }
                    None
                }
                items => items,
            };

            match items {
                Some(items) => {
                    for (index, item) in items.into_iter().enumerate() {
                        let mut row = doc.clone();
                        set_nested_value(&mut row, &self.path, item);
                        if let Some(field) = &self.include_array_index {
                            set_nested_value(&mut row, field, Value::from(index));
                        }
                        results.push(row);
                    }
                }
                None if self.preserve_null_and_empty_arrays => {
                    if let Some(field) = &self.include_array_index {
                        set_nested_value(&mut doc, field, Value::Null);
                    }
                    results.push(doc);
                }
                None => {}
            }
        }

        Ok(results)
    }
}

// ============================================================================
// $group
// ============================================================================

impl GroupStage {
    /// Group on a field reference ("$compras.nome_produto")
    pub fn by(reference: &str) -> Self {
        GroupStage {
            id: GroupId::Field(field_path(reference).unwrap_or(reference).to_string()),
            accumulators: BTreeMap::new(),
        }
    }

    /// Single group over all documents (`_id: null`)
    pub fn all() -> Self {
        GroupStage {
            id: GroupId::Null,
            accumulators: BTreeMap::new(),
        }
    }

    pub fn accumulate(mut self, field: &str, accumulator: Accumulator) -> Self {
        self.accumulators.insert(field.to_string(), accumulator);
        self
    }

    fn from_json(spec: &Value) -> Result<Self> {
        let Value::Object(obj) = spec else {
            return Err(VendasError::AggregationError(
                "$group must be an object".to_string(),
            ));
        };

        let id = match obj.get("_id") {
            Some(Value::Null) => GroupId::Null,
            Some(Value::String(s)) => GroupId::Field(
                field_path(s)
                    .ok_or_else(|| {
                        VendasError::AggregationError(
                            "Group _id field reference must start with $".to_string(),
                        )
                    })?
                    .to_string(),
            ),
            Some(_) => {
                return Err(VendasError::AggregationError(
                    "Group _id must be null or field reference".to_string(),
                ))
            }
            None => {
                return Err(VendasError::AggregationError(
                    "Group stage must have _id field".to_string(),
                ))
            }
        };

        let mut accumulators = BTreeMap::new();
        for (field, value) in obj.iter().filter(|(field, _)| *field != "_id") {
            accumulators.insert(field.clone(), Accumulator::from_json(value)?);
        }

        Ok(GroupStage { id, accumulators })
    }

    fn to_json(&self) -> Value {
        let mut obj = Map::new();
        obj.insert(
            "_id".to_string(),
            match &self.id {
                GroupId::Null => Value::Null,
                GroupId::Field(path) => reference(path),
            },
        );
        for (field, accumulator) in &self.accumulators {
            obj.insert(field.clone(), accumulator.to_json());
        }
        Value::Object(obj)
    }

    fn execute(&self, docs: Vec<Value>) -> Result<Vec<Value>> {
        // Groups keep first-seen order
        let mut positions: HashMap<String, usize> = HashMap::new();
        let mut groups: Vec<(Value, Vec<Value>)> = Vec::new();

        for doc in docs {
            let key = self.group_key(&doc);
            let canonical = canonical_json_string(&key);
            match positions.get(&canonical) {
                Some(&position) => groups[position].1.push(doc),
                None => {
                    positions.insert(canonical, groups.len());
                    groups.push((key, vec![doc]));
                }
            }
        }

        let mut results = Vec::with_capacity(groups.len());
        for (key, group_docs) in groups {
            let mut result = Map::new();
            result.insert("_id".to_string(), key);
            for (field, accumulator) in &self.accumulators {
                result.insert(field.clone(), accumulator.compute(&group_docs));
            }
            results.push(Value::Object(result));
        }

        Ok(results)
    }

    fn group_key(&self, doc: &Value) -> Value {
        match &self.id {
            GroupId::Null => Value::Null,
            GroupId::Field(field) => get_nested_value(doc, field).cloned().unwrap_or(Value::Null),
        }
    }
}

impl Accumulator {
    fn from_json(spec: &Value) -> Result<Self> {
        let Value::Object(obj) = spec else {
            return Err(VendasError::AggregationError(
                "Accumulator must be an object".to_string(),
            ));
        };

        let (op, value) = match obj.iter().next() {
            Some(entry) if obj.len() == 1 => entry,
            _ => {
                return Err(VendasError::AggregationError(
                    "Accumulator must have exactly one operator".to_string(),
                ))
            }
        };

        match op.as_str() {
            "$sum" => match value {
                Value::Number(n) => n
                    .as_i64()
                    .map(|n| Accumulator::Sum(SumExpression::Constant(n)))
                    .ok_or_else(|| {
                        VendasError::AggregationError(
                            "$sum constant must be an integer".to_string(),
                        )
                    }),
                Value::String(_) => Ok(Accumulator::Sum(SumExpression::Field(
                    parse_field_reference(value, "$sum")?,
                ))),
                _ => Err(VendasError::AggregationError(
                    "$sum must be a number or field reference".to_string(),
                )),
            },
            "$avg" => Ok(Accumulator::Avg(parse_field_reference(value, "$avg")?)),
            "$min" => Ok(Accumulator::Min(parse_field_reference(value, "$min")?)),
            "$max" => Ok(Accumulator::Max(parse_field_reference(value, "$max")?)),
            "$first" => Ok(Accumulator::First(parse_field_reference(value, "$first")?)),
            "$last" => Ok(Accumulator::Last(parse_field_reference(value, "$last")?)),
            "$push" => Ok(Accumulator::Push(parse_field_reference(value, "$push")?)),
            "$addToSet" => Ok(Accumulator::AddToSet(parse_field_reference(
                value,
                "$addToSet",
            )?)),
            _ => Err(VendasError::AggregationError(format!(
                "Unknown accumulator: {}",
                op
            ))),
        }
    }

    fn to_json(&self) -> Value {
        match self {
            Accumulator::Sum(SumExpression::Constant(n)) => json!({ "$sum": n }),
            Accumulator::Sum(SumExpression::Field(field)) => json!({ "$sum": reference(field) }),
            Accumulator::Avg(field) => json!({ "$avg": reference(field) }),
            Accumulator::Min(field) => json!({ "$min": reference(field) }),
            Accumulator::Max(field) => json!({ "$max": reference(field) }),
            Accumulator::First(field) => json!({ "$first": reference(field) }),
            Accumulator::Last(field) => json!({ "$last": reference(field) }),
            Accumulator::Push(field) => json!({ "$push": reference(field) }),
            Accumulator::AddToSet(field) => json!({ "$addToSet": reference(field) }),
        }
    }

    fn compute(&self, docs: &[Value]) -> Value {
        let field_of = |doc: &Value, field: &str| get_nested_value(doc, field).cloned();

        match self {
            Accumulator::Sum(SumExpression::Constant(n)) => {
                Value::from(n.saturating_mul(docs.len() as i64))
            }
            Accumulator::Sum(SumExpression::Field(field)) => {
                let mut sum_int: i64 = 0;
                let mut sum_float: f64 = 0.0;
                let mut has_float = false;

                for value in docs.iter().filter_map(|doc| get_nested_value(doc, field)) {
                    if let Some(n) = value.as_i64() {
                        sum_int = sum_int.saturating_add(n);
                    } else if let Some(f) = value.as_f64() {
                        sum_float += f;
                        has_float = true;
                    }
                }

                if has_float {
                    Value::from(sum_float + sum_int as f64)
                } else {
                    Value::from(sum_int)
                }
            }
            Accumulator::Avg(field) => {
                let numbers: Vec<f64> = docs
                    .iter()
                    .filter_map(|doc| get_nested_value(doc, field).and_then(Value::as_f64))
                    .collect();
                if numbers.is_empty() {
                    Value::Null
                } else {
                    Value::from(numbers.iter().sum::<f64>() / numbers.len() as f64)
                }
            }
            Accumulator::Min(field) => compute_extremum(docs, field, Ordering::Less),
            Accumulator::Max(field) => compute_extremum(docs, field, Ordering::Greater),
            Accumulator::First(field) => docs
                .first()
                .and_then(|doc| field_of(doc, field))
                .unwrap_or(Value::Null),
            Accumulator::Last(field) => docs
                .last()
                .and_then(|doc| field_of(doc, field))
                .unwrap_or(Value::Null),
            Accumulator::Push(field) => Value::Array(
                docs.iter()
                    .filter_map(|doc| field_of(doc, field))
                    .collect(),
            ),
            Accumulator::AddToSet(field) => {
                let mut seen = HashSet::new();
                Value::Array(
                    docs.iter()
                        .filter_map(|doc| field_of(doc, field))
                        .filter(|value| seen.insert(canonical_json_string(value)))
                        .collect(),
                )
            }
        }
    }
}

// ============================================================================
// $project
// ============================================================================

impl ProjectStage {
    pub fn new() -> Self {
        ProjectStage::default()
    }

    pub fn include(mut self, field: &str) -> Self {
        self.fields.insert(field.to_string(), ProjectField::Include);
        self
    }

    pub fn exclude(mut self, field: &str) -> Self {
        self.fields.insert(field.to_string(), ProjectField::Exclude);
        self
    }

    /// `{target: "$source"}`
    pub fn rename(mut self, target: &str, source: &str) -> Self {
        let source = field_path(source).unwrap_or(source);
        self.fields
            .insert(target.to_string(), ProjectField::Rename(source.to_string()));
        self
    }

    fn from_json(spec: &Value) -> Result<Self> {
        let Value::Object(obj) = spec else {
            return Err(VendasError::AggregationError(
                "$project must be an object".to_string(),
            ));
        };

        let mut fields = BTreeMap::new();
        for (field, value) in obj {
            let project_field = match value {
                Value::Bool(true) => ProjectField::Include,
                Value::Bool(false) => ProjectField::Exclude,
                Value::Number(n) => match n.as_f64() {
                    Some(v) if v == 1.0 => ProjectField::Include,
                    Some(v) if v == 0.0 => ProjectField::Exclude,
                    _ => {
                        return Err(VendasError::AggregationError(format!(
                            "Invalid project value: {}",
                            n
                        )))
                    }
                },
                Value::String(s) => match field_path(s) {
                    Some(source) => ProjectField::Rename(source.to_string()),
                    None => {
                        return Err(VendasError::AggregationError(format!(
                            "Invalid project expression: {}",
                            s
                        )))
                    }
                },
                _ => {
                    return Err(VendasError::AggregationError(
                        "Project field must be 0, 1, or field reference".to_string(),
                    ))
                }
            };
            fields.insert(field.clone(), project_field);
        }

        let stage = ProjectStage { fields };
        stage.validate()?;
        Ok(stage)
    }

    fn validate(&self) -> Result<()> {
        // Excluding _id is the only exclusion allowed next to inclusions
        let has_non_id_exclusions = self
            .fields
            .iter()
            .any(|(field, action)| *action == ProjectField::Exclude && field != "_id");
        if self.include_mode() && has_non_id_exclusions {
            return Err(VendasError::AggregationError(
                "Cannot mix inclusion and exclusion in $project".to_string(),
            ));
        }
        Ok(())
    }

    fn include_mode(&self) -> bool {
        self.fields
            .values()
            .any(|f| matches!(f, ProjectField::Include | ProjectField::Rename(_)))
    }

    fn to_json(&self) -> Value {
        let mut obj = Map::new();
        for (field, action) in &self.fields {
            let spec = match action {
                ProjectField::Include => Value::from(1),
                ProjectField::Exclude => Value::from(0),
                ProjectField::Rename(source) => reference(source),
            };
            obj.insert(field.clone(), spec);
        }
        Value::Object(obj)
    }

    fn execute(&self, docs: Vec<Value>) -> Result<Vec<Value>> {
        self.validate()?;
        Ok(docs.iter().map(|doc| self.project_document(doc)).collect())
    }

    fn project_document(&self, doc: &Value) -> Value {
        if !self.include_mode() {
            let mut result = doc.clone();
            for field in self.fields.keys() {
                remove_nested_value(&mut result, field);
            }
            return result;
        }

        let mut result = Value::Object(Map::new());

        if !self.fields.contains_key("_id") {
            if let Some(id) = doc.get("_id") {
                set_nested_value(&mut result, "_id", id.clone());
            }
        }

        for (field, action) in &self.fields {
            let source = match action {
                ProjectField::Include => field.as_str(),
                ProjectField::Rename(source) => source.as_str(),
                ProjectField::Exclude => continue,
            };
            if let Some(value) = get_nested_value(doc, source) {
                set_nested_value(&mut result, field, value.clone());
            }
        }

        result
    }
}

// ============================================================================
// $sort, $limit, $skip
// ============================================================================

impl SortStage {
    fn from_json(spec: &Value) -> Result<Self> {
        let Value::Object(obj) = spec else {
            return Err(VendasError::AggregationError(
                "$sort must be an object".to_string(),
            ));
        };
        if obj.is_empty() {
            return Err(VendasError::AggregationError(
                "$sort must have at least one field".to_string(),
            ));
        }

        let mut fields = Vec::new();
        for (field, value) in obj {
            let direction = match value.as_i64() {
                Some(1) => SortDirection::Ascending,
                Some(-1) => SortDirection::Descending,
                _ => {
                    return Err(VendasError::AggregationError(
                        "Sort direction must be 1 or -1".to_string(),
                    ))
                }
            };
            fields.push((field.clone(), direction));
        }

        Ok(SortStage { fields })
    }

    fn to_json(&self) -> Value {
        let mut obj = Map::new();
        for (field, direction) in &self.fields {
            let n = match direction {
                SortDirection::Ascending => 1,
                SortDirection::Descending => -1,
            };
            obj.insert(field.clone(), Value::from(n));
        }
        Value::Object(obj)
    }

    fn execute(&self, mut docs: Vec<Value>) -> Result<Vec<Value>> {
        docs.sort_by(|a, b| {
            for (field, direction) in &self.fields {
                let cmp = compare_values_with_none(
                    get_nested_value(a, field),
                    get_nested_value(b, field),
                );
                let cmp = match direction {
                    SortDirection::Ascending => cmp,
                    SortDirection::Descending => cmp.reverse(),
                };
                if cmp != Ordering::Equal {
                    return cmp;
                }
            }
            Ordering::Equal
        });

        Ok(docs)
    }
}

impl LimitStage {
    fn from_json(spec: &Value) -> Result<Self> {
        spec.as_u64()
            .map(|n| LimitStage { limit: n as usize })
            .ok_or_else(|| {
                VendasError::AggregationError("$limit must be a positive number".to_string())
            })
    }

    fn execute(&self, docs: Vec<Value>) -> Result<Vec<Value>> {
        Ok(docs.into_iter().take(self.limit).collect())
    }
}

impl SkipStage {
    fn from_json(spec: &Value) -> Result<Self> {
        spec.as_u64()
            .map(|n| SkipStage { skip: n as usize })
            .ok_or_else(|| {
                VendasError::AggregationError("$skip must be a positive number".to_string())
            })
    }

    fn execute(&self, docs: Vec<Value>) -> Result<Vec<Value>> {
        Ok(docs.into_iter().skip(self.skip).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vendas() -> Vec<Value> {
        vec![
            json!({"_id": 1, "cliente": "Ana", "compras": [
                {"nome_produto": "Caneta", "valor": 2},
                {"nome_produto": "Caderno", "valor": 18.5}
            ]}),
            json!({"_id": 2, "cliente": "Bruno", "compras": [
                {"nome_produto": "Caneta", "valor": 3}
            ]}),
            json!({"_id": 3, "cliente": "Carla", "compras": []}),
            json!({"_id": 4, "cliente": "Davi"}),
        ]
    }

    fn names(rows: &[Value], field: &str) -> Vec<Value> {
        rows.iter().map(|r| r[field].clone()).collect()
    }

    // ========== Pipeline tests ==========

    #[test]
    fn test_pipeline_not_array() {
        let result = Pipeline::from_json(&json!({"$unwind": "$compras"}));
        assert!(result.unwrap_err().to_string().contains("must be an array"));
    }

    #[test]
    fn test_pipeline_empty() {
        let result = Pipeline::from_json(&json!([]));
        assert!(result.unwrap_err().to_string().contains("cannot be empty"));
        assert!(Pipeline::builder().build().stages().is_empty());
    }

    #[test]
    fn test_stage_not_object() {
        let result = Stage::from_json(&json!("invalid"));
        assert!(result.unwrap_err().to_string().contains("must be an object"));
    }

    #[test]
    fn test_stage_multiple_operators() {
        let result = Stage::from_json(&json!({"$unwind": "$a", "$sort": {"a": 1}}));
        assert!(result.unwrap_err().to_string().contains("exactly one operator"));
        let result = Stage::from_json(&json!({}));
        assert!(result.unwrap_err().to_string().contains("exactly one operator"));
    }

    #[test]
    fn test_stage_unknown_operator() {
        let result = Stage::from_json(&json!({"$lookup": {}}));
        assert!(result.unwrap_err().to_string().contains("Unknown pipeline stage"));
    }

    #[test]
    fn test_builder_matches_json_form() {
        let built = Pipeline::builder()
            .unwind("$compras")
            .group(GroupStage::by("$compras.nome_produto"))
            .project(ProjectStage::new().rename("nome_produto", "$_id").exclude("_id"))
            .build();
        let parsed = Pipeline::from_json(&json!([
            {"$unwind": "$compras"},
            {"$group": {"_id": "$compras.nome_produto"}},
            {"$project": {"nome_produto": "$_id", "_id": 0}}
        ]))
        .unwrap();
        assert_eq!(built, parsed);
        assert_eq!(Pipeline::from_json(&built.to_json()).unwrap(), built);
    }

    #[test]
    fn test_to_json_rendering() {
        let pipeline = Pipeline::builder()
            .unwind_with(UnwindStage::new("itens").include_array_index("pos"))
            .group(GroupStage::all().accumulate("total", Accumulator::Sum(SumExpression::Constant(1))))
            .sort("total", SortDirection::Descending)
            .skip(1)
            .limit(5)
            .build();
        assert_eq!(
            pipeline.to_json(),
            json!([
                {"$unwind": {"path": "$itens", "includeArrayIndex": "pos"}},
                {"$group": {"_id": null, "total": {"$sum": 1}}},
                {"$sort": {"total": -1}},
                {"$skip": 1},
                {"$limit": 5}
            ])
        );
    }

    // ========== $unwind tests ==========

    #[test]
    fn test_unwind_one_row_per_element() {
        let stage = UnwindStage::from_json(&json!("$compras")).unwrap();
        let rows = stage.execute(vendas()).unwrap();

        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0]["compras"]["nome_produto"], "Caneta");
        assert_eq!(rows[1]["compras"]["nome_produto"], "Caderno");
        assert_eq!(rows[2]["cliente"], "Bruno");
        assert_eq!(rows[0]["_id"], 1);
        assert_eq!(rows[1]["_id"], 1);
    }

    #[test]
    fn test_unwind_skips_empty_missing_and_null() {
        let docs = vec![
            json!({"compras": []}),
            json!({"cliente": "sem compras"}),
            json!({"compras": null}),
        ];
        let rows = UnwindStage::new("compras").execute(docs).unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn test_unwind_non_array_is_query_error() {
        let docs = vec![json!({"compras": {"nome_produto": "Caneta"}})];
        let err = UnwindStage::new("$compras").execute(docs).unwrap_err();
        assert!(matches!(err, VendasError::QueryExecution(_)));
        assert!(err.to_string().contains("must be an array, found object"));
    }

    #[test]
    fn test_unwind_preserve_null_and_empty() {
        let stage = UnwindStage::from_json(&json!({
            "path": "$compras",
            "preserveNullAndEmptyArrays": true,
            "includeArrayIndex": "posicao"
        }))
        .unwrap();
        let rows = stage.execute(vendas()).unwrap();

        assert_eq!(rows.len(), 5);
        assert_eq!(rows[1]["posicao"], 1);
        assert!(rows[3].get("compras").is_none());
        assert!(rows[3]["posicao"].is_null());
        assert_eq!(rows[4]["cliente"], "Davi");
    }

    #[test]
    fn test_unwind_nested_path() {
        let docs = vec![json!({"pedido": {"itens": ["a", "b"]}})];
        let rows = UnwindStage::new("$pedido.itens").execute(docs).unwrap();
        assert_eq!(names(&rows, "pedido"), vec![json!({"itens": "a"}), json!({"itens": "b"})]);
    }

    #[test]
    fn test_unwind_invalid_specs() {
        assert!(UnwindStage::from_json(&json!("compras"))
            .unwrap_err()
            .to_string()
            .contains("must start with $"));
        assert!(UnwindStage::from_json(&json!({"preserveNullAndEmptyArrays": true}))
            .unwrap_err()
            .to_string()
            .contains("requires a path"));
        assert!(UnwindStage::from_json(&json!({"path": "$a", "other": 1}))
            .unwrap_err()
            .to_string()
            .contains("Unknown $unwind option"));
        assert!(UnwindStage::from_json(&json!({"path": "$a", "includeArrayIndex": "$i"})).is_err());
        assert!(UnwindStage::from_json(&json!(5)).is_err());
    }

    // ========== $group tests ==========

    #[test]
    fn test_group_distinct_keys_first_seen_order() {
        let rows = vec![
            json!({"p": "B"}),
            json!({"p": "A"}),
            json!({"p": "B"}),
            json!({"p": "C"}),
        ];
        let result = GroupStage::by("$p").execute(rows).unwrap();
        assert_eq!(names(&result, "_id"), vec![json!("B"), json!("A"), json!("C")]);
        assert_eq!(result[0], json!({"_id": "B"}));
    }

    #[test]
    fn test_group_missing_field_groups_as_null() {
        let rows = vec![json!({"p": "A"}), json!({}), json!({"p": null})];
        let result = GroupStage::by("$p").execute(rows).unwrap();
        assert_eq!(result.len(), 2);
        assert!(result[1]["_id"].is_null());
    }

    #[test]
    fn test_group_object_keys_ignore_field_order() {
        let rows = vec![json!({"k": {"a": 1, "b": 2}}), json!({"k": {"b": 2, "a": 1}})];
        let result = GroupStage::by("$k").execute(rows).unwrap();
        assert_eq!(result.len(), 1);
    }

    #[test]
    fn test_group_parse_errors() {
        let err = |spec: Value| GroupStage::from_json(&spec).unwrap_err().to_string();
        assert!(err(json!({"n": {"$sum": 1}})).contains("must have _id field"));
        assert!(err(json!({"_id": "nome"})).contains("must start with $"));
        assert!(err(json!({"_id": 123})).contains("must be null or field reference"));
        assert!(err(json!("invalid")).contains("must be an object"));
    }

    #[test]
    fn test_accumulators() {
        let rows = UnwindStage::new("compras").execute(vendas()).unwrap();
        let stage = GroupStage::from_json(&json!({
            "_id": "$compras.nome_produto",
            "quantidade": {"$sum": 1},
            "total": {"$sum": "$compras.valor"},
            "media": {"$avg": "$compras.valor"},
            "menor": {"$min": "$compras.valor"},
            "maior": {"$max": "$compras.valor"},
            "primeiro": {"$first": "$cliente"},
            "ultimo": {"$last": "$cliente"},
            "clientes": {"$push": "$cliente"},
            "lojas": {"$addToSet": "$loja"}
        }))
        .unwrap();
        let result = stage.execute(rows).unwrap();

        let caneta = &result[0];
        assert_eq!(caneta["_id"], "Caneta");
        assert_eq!(caneta["quantidade"], 2);
        assert_eq!(caneta["total"], 5);
        assert_eq!(caneta["media"], 2.5);
        assert_eq!(caneta["menor"], 2);
        assert_eq!(caneta["maior"], 3);
        assert_eq!(caneta["primeiro"], "Ana");
        assert_eq!(caneta["ultimo"], "Bruno");
        assert_eq!(caneta["clientes"], json!(["Ana", "Bruno"]));
        assert_eq!(caneta["lojas"], json!([]));

        let caderno = &result[1];
        assert_eq!(caderno["total"], 18.5);
        assert_eq!(caderno["quantidade"], 1);
    }

    #[test]
    fn test_accumulators_on_missing_fields() {
        let stage = GroupStage::from_json(&json!({
            "_id": null,
            "media": {"$avg": "$v"},
            "menor": {"$min": "$v"},
            "primeiro": {"$first": "$v"}
        }))
        .unwrap();
        let result = stage.execute(vec![json!({})]).unwrap();
        assert!(result[0]["media"].is_null());
        assert!(result[0]["menor"].is_null());
        assert!(result[0]["primeiro"].is_null());
    }

    #[test]
    fn test_add_to_set_deduplicates() {
        let rows = vec![json!({"t": "x"}), json!({"t": "y"}), json!({"t": "x"})];
        let stage = GroupStage::all().accumulate("tags", Accumulator::AddToSet("t".to_string()));
        let result = stage.execute(rows).unwrap();
        assert_eq!(result[0]["tags"], json!(["x", "y"]));
    }

    #[test]
    fn test_accumulator_parse_errors() {
        let err = |spec: Value| Accumulator::from_json(&spec).unwrap_err().to_string();
        assert!(err(json!({"$sum": "valor"})).contains("must start with $"));
        assert!(err(json!({"$sum": true})).contains("must be a number or field reference"));
        assert!(err(json!({"$sum": 1.5})).contains("must be an integer"));
        assert!(err(json!({"$avg": 1})).contains("must be a field reference"));
        assert!(err(json!({"$median": "$v"})).contains("Unknown accumulator"));
        assert!(err(json!("$sum")).contains("must be an object"));
        assert!(err(json!({"$min": "$a", "$max": "$a"})).contains("exactly one operator"));
    }

    // ========== $project tests ==========

    #[test]
    fn test_project_rename_and_drop_id() {
        let rows = vec![json!({"_id": "Caneta"}), json!({"_id": "Caderno"})];
        let stage = ProjectStage::from_json(&json!({"nome_produto": "$_id", "_id": 0})).unwrap();
        let result = stage.execute(rows).unwrap();
        assert_eq!(
            result,
            vec![json!({"nome_produto": "Caneta"}), json!({"nome_produto": "Caderno"})]
        );
    }

    #[test]
    fn test_project_include_keeps_id() {
        let docs = vec![json!({"_id": 7, "cliente": "Ana", "loja": {"cidade": "Recife"}})];
        let stage = ProjectStage::from_json(&json!({"cliente": 1, "loja.cidade": true})).unwrap();
        let result = stage.execute(docs).unwrap();
        assert_eq!(
            result[0],
            json!({"_id": 7, "cliente": "Ana", "loja": {"cidade": "Recife"}})
        );
    }

    #[test]
    fn test_project_exclude_mode() {
        let docs = vec![json!({"_id": 1, "cliente": "Ana", "loja": {"cidade": "Recife", "uf": "PE"}})];
        let stage = ProjectStage::new().exclude("cliente").exclude("loja.uf");
        let result = stage.execute(docs).unwrap();
        assert_eq!(result[0], json!({"_id": 1, "loja": {"cidade": "Recife"}}));
    }

    #[test]
    fn test_project_rename_missing_source() {
        let stage = ProjectStage::new().rename("nome", "$nao_existe");
        let result = stage.execute(vec![json!({"x": 1})]).unwrap();
        assert_eq!(result[0], json!({}));
    }

    #[test]
    fn test_project_parse_errors() {
        let err = |spec: Value| ProjectStage::from_json(&spec).unwrap_err().to_string();
        assert!(err(json!({"f": 5})).contains("Invalid project value"));
        assert!(err(json!({"f": "not_a_ref"})).contains("Invalid project expression"));
        assert!(err(json!({"f": [1, 2]})).contains("must be 0, 1, or field reference"));
        assert!(err(json!("invalid")).contains("must be an object"));
        assert!(err(json!({"a": 1, "b": 0})).contains("Cannot mix inclusion and exclusion"));
    }

    // ========== $sort / $limit / $skip tests ==========

    #[test]
    fn test_sort_strings_and_missing() {
        let docs = vec![
            json!({"n": "Caneta"}),
            json!({}),
            json!({"n": "Borracha"}),
            json!({"n": "Caderno"}),
        ];
        let stage = SortStage::from_json(&json!({"n": 1})).unwrap();
        let result = stage.execute(docs.clone()).unwrap();
        assert_eq!(
            names(&result, "n"),
            vec![Value::Null, json!("Borracha"), json!("Caderno"), json!("Caneta")]
        );

        let stage = SortStage::from_json(&json!({"n": -1})).unwrap();
        let result = stage.execute(docs).unwrap();
        assert_eq!(result[0]["n"], "Caneta");
        assert!(result[3].get("n").is_none());
    }

    #[test]
    fn test_sort_multi_field_is_stable() {
        let docs = vec![
            json!({"loja": "B", "v": 1, "ordem": 0}),
            json!({"loja": "A", "v": 2, "ordem": 1}),
            json!({"loja": "A", "v": 2, "ordem": 2}),
            json!({"loja": "A", "v": 3, "ordem": 3}),
        ];
        let stage = SortStage::from_json(&json!({"loja": 1, "v": -1})).unwrap();
        let result = stage.execute(docs).unwrap();
        assert_eq!(names(&result, "ordem"), vec![json!(3), json!(1), json!(2), json!(0)]);
    }

    #[test]
    fn test_sort_parse_errors() {
        assert!(SortStage::from_json(&json!({"a": 2})).is_err());
        assert!(SortStage::from_json(&json!({"a": "asc"})).is_err());
        assert!(SortStage::from_json(&json!({})).is_err());
        assert!(SortStage::from_json(&json!([])).is_err());
    }

    #[test]
    fn test_limit_and_skip() {
        let docs: Vec<Value> = (0..5).map(|i| json!({"i": i})).collect();
        let pipeline = Pipeline::from_json(&json!([{"$skip": 1}, {"$limit": 2}])).unwrap();
        let result = pipeline.execute(docs).unwrap();
        assert_eq!(names(&result, "i"), vec![json!(1), json!(2)]);

        assert!(LimitStage::from_json(&json!(-1)).is_err());
        assert!(SkipStage::from_json(&json!("2")).is_err());
    }

    // ========== full pipelines ==========

    #[test]
    fn test_distinct_products_pipeline() {
        let pipeline = Pipeline::from_json(&json!([
            {"$unwind": "$compras"},
            {"$group": {"_id": "$compras.nome_produto"}},
            {"$project": {"nome_produto": "$_id", "_id": 0}}
        ]))
        .unwrap();
        let result = pipeline.execute(vendas()).unwrap();
        assert_eq!(
            result,
            vec![json!({"nome_produto": "Caneta"}), json!({"nome_produto": "Caderno"})]
        );
    }

    #[test]
    fn test_pipeline_error_is_terminal() {
        let pipeline = Pipeline::builder()
            .unwind("$compras")
            .group(GroupStage::by("$compras.nome_produto"))
            .build();
        let mut docs = vendas();
        docs.push(json!({"compras": "Caneta"}));
        assert!(matches!(
            pipeline.execute(docs),
            Err(VendasError::QueryExecution(_))
        ));
    }
}
