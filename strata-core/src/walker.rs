//! Response tree walker.
//!
//! Turns a JSON data tree plus its selection set into a flat stream of
//! [`ResolveEvent`]s. Traversal state is an explicit work stack, so deeply
//! nested responses never grow the call stack.

use crate::error::{StrataError, StrataResult};
use crate::operation::{collect_fields, FieldType, ResponseField, Variables};
use serde_json::{Map, Value};

/// One boundary in the response tree.
#[derive(Debug, Clone, PartialEq)]
pub enum ResolveEvent<'a> {
    EnterField(&'a ResponseField),
    ExitField(&'a ResponseField),
    EnterObject {
        field: &'a ResponseField,
        object: &'a Map<String, Value>,
    },
    ExitObject(&'a ResponseField),
    EnterList {
        field: &'a ResponseField,
        len: usize,
    },
    ExitList {
        field: &'a ResponseField,
        len: usize,
    },
    EnterElement(usize),
    ExitElement(usize),
    Scalar(&'a Value),
    /// Explicit null. Absent fields produce no events at all.
    Null,
}

enum Step<'a> {
    Emit(ResolveEvent<'a>),
    Field {
        field: &'a ResponseField,
        object: &'a Map<String, Value>,
    },
    Value {
        field: &'a ResponseField,
        field_type: &'a FieldType,
        value: &'a Value,
    },
}

/// Iterator over the events of one data tree. Stops after the first error.
pub struct ResponseWalker<'a> {
    variables: &'a Variables,
    stack: Vec<Step<'a>>,
    failed: bool,
}

impl<'a> ResponseWalker<'a> {
    pub fn new(
        selections: &'a [ResponseField],
        variables: &'a Variables,
        data: &'a Map<String, Value>,
    ) -> Self {
        let mut walker = Self {
            variables,
            stack: Vec::new(),
            failed: false,
        };
        walker.push_fields(selections, data);
        walker
    }

    fn push_fields(&mut self, selections: &'a [ResponseField], object: &'a Map<String, Value>) {
        let typename = object.get("__typename").and_then(Value::as_str);
        let fields = collect_fields(selections, typename, self.variables);
        for field in fields.into_iter().rev() {
            self.stack.push(Step::Field { field, object });
        }
    }

    fn fail(&mut self, reason: String) -> Option<StrataResult<ResolveEvent<'a>>> {
        self.failed = true;
        self.stack.clear();
        Some(Err(StrataError::parse(reason)))
    }
}

impl<'a> Iterator for ResponseWalker<'a> {
    type Item = StrataResult<ResolveEvent<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        loop {
            match self.stack.pop()? {
                Step::Emit(event) => return Some(Ok(event)),
                Step::Field { field, object } => {
                    let Some(value) = object.get(&field.response_name) else {
                        tracing::trace!(field = %field.response_name, "field absent from response");
                        continue;
                    };
                    self.stack.push(Step::Emit(ResolveEvent::ExitField(field)));
                    self.stack.push(Step::Value {
                        field,
                        field_type: &field.field_type,
                        value,
                    });
                    return Some(Ok(ResolveEvent::EnterField(field)));
                }
                Step::Value {
                    field,
                    field_type,
                    value,
                } => {
                    if value.is_null() {
                        if !field.optional {
                            tracing::trace!(field = %field.response_name, "null in non-null position");
                        }
                        return Some(Ok(ResolveEvent::Null));
                    }
                    match field_type {
                        FieldType::Scalar | FieldType::CustomScalar(_) => {
                            return Some(Ok(ResolveEvent::Scalar(value)));
                        }
                        FieldType::Object(selections) => {
                            let Some(object) = value.as_object() else {
                                return self.fail(format!(
                                    "expected object for field {}, got {}",
                                    field.response_name, value
                                ));
                            };
                            self.stack.push(Step::Emit(ResolveEvent::ExitObject(field)));
                            self.push_fields(selections, object);
                            return Some(Ok(ResolveEvent::EnterObject { field, object }));
                        }
                        FieldType::List(item_type) => {
                            let Some(items) = value.as_array() else {
                                return self.fail(format!(
                                    "expected list for field {}, got {}",
                                    field.response_name, value
                                ));
                            };
                            let len = items.len();
                            self.stack
                                .push(Step::Emit(ResolveEvent::ExitList { field, len }));
                            for (index, item) in items.iter().enumerate().rev() {
                                self.stack.push(Step::Emit(ResolveEvent::ExitElement(index)));
                                self.stack.push(Step::Value {
                                    field,
                                    field_type: item_type.as_ref(),
                                    value: item,
                                });
                                self.stack.push(Step::Emit(ResolveEvent::EnterElement(index)));
                            }
                            return Some(Ok(ResolveEvent::EnterList { field, len }));
                        }
                        // Flattened by collect_fields before a value step exists.
                        FieldType::Fragment { .. } => continue,
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tags(selections: &[ResponseField], data: &Value) -> Vec<String> {
        let vars = Variables::new();
        let object = data.as_object().cloned().unwrap_or_default();
        ResponseWalker::new(selections, &vars, &object)
            .map(|event| match event.unwrap() {
                ResolveEvent::EnterField(f) => format!("+{}", f.response_name),
                ResolveEvent::ExitField(f) => format!("-{}", f.response_name),
                ResolveEvent::EnterObject { .. } => "{".to_string(),
                ResolveEvent::ExitObject(_) => "}".to_string(),
                ResolveEvent::EnterList { len, .. } => format!("[{len}"),
                ResolveEvent::ExitList { .. } => "]".to_string(),
                ResolveEvent::EnterElement(i) => format!("<{i}"),
                ResolveEvent::ExitElement(i) => format!("{i}>"),
                ResolveEvent::Scalar(v) => v.to_string(),
                ResolveEvent::Null => "null".to_string(),
            })
            .collect()
    }

    #[test]
    fn test_event_order() {
        let selections = vec![ResponseField::object(
            "hero",
            vec![
                ResponseField::scalar("name"),
                ResponseField::list("appearsIn", FieldType::Scalar),
            ],
        )];
        let data = json!({ "hero": { "name": "R2-D2", "appearsIn": ["NEWHOPE", null] } });

        assert_eq!(
            tags(&selections, &data),
            vec![
                "+hero", "{", "+name", "\"R2-D2\"", "-name", "+appearsIn", "[2", "<0",
                "\"NEWHOPE\"", "0>", "<1", "null", "1>", "]", "-appearsIn", "}", "-hero"
            ]
        );
    }

    #[test]
    fn test_absent_field_emits_nothing() {
        let selections = vec![ResponseField::scalar("name"), ResponseField::scalar("id")];
        let data = json!({ "name": null });
        assert_eq!(tags(&selections, &data), vec!["+name", "null", "-name"]);
    }

    #[test]
    fn test_shape_mismatch_is_parse_error() {
        let selections = vec![ResponseField::object("hero", vec![])];
        let data = json!({ "hero": 12 });
        let object = data.as_object().cloned().unwrap_or_default();
        let vars = Variables::new();
        let events: Vec<_> = ResponseWalker::new(&selections, &vars, &object).collect();
        assert!(matches!(events.last(), Some(Err(StrataError::Parse { .. }))));
        assert_eq!(events.len(), 2);
    }
}
