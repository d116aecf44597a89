//! Pipeline description documents.
//!
//! A description uses the same document format as the metadata tree. The
//! top-level element holds `Pipeline` elements identified by `Name`; each
//! pipeline's children are its instructions.

use crate::attribute::{Attributes, FromAttribute};
use crate::document::DocumentNode;
use crate::error::{Error, Result};
use std::fmt;
use std::path::Path;

/// A command-line argument a pipeline accepts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArgumentSpec {
    pub name: String,
    pub default: Option<String>,
    pub help: Option<String>,
}

/// One pipeline instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instruction {
    /// Bind the first valid match of `xpath` to `variable`.
    Select {
        xpath: String,
        root: Option<String>,
        variable: String,
        clean_if_invalid: bool,
    },
    /// Run `body` once per match of `xpath`.
    Iterate {
        xpath: String,
        root: Option<String>,
        variable: Option<String>,
        body: Vec<Instruction>,
    },
    /// Stop the enclosing body unless `attribute` matches `pattern`.
    RequireMatch {
        root: Option<String>,
        attribute: String,
        pattern: String,
    },
    /// Invoke a registered operation.
    Call {
        module: String,
        function: String,
        arguments: Vec<(String, String)>,
        parameters: Vec<(String, String)>,
    },
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Instruction::Select {
                xpath, variable, ..
            } => write!(f, "Select[XPath='{xpath}', VariableName='{variable}']"),
            Instruction::Iterate { xpath, .. } => write!(f, "Iterate[XPath='{xpath}']"),
            Instruction::RequireMatch {
                attribute, pattern, ..
            } => write!(f, "RequireMatch[Attribute='{attribute}', Pattern='{pattern}']"),
            Instruction::Call {
                module, function, ..
            } => write!(f, "Call[{module}.{function}]"),
        }
    }
}

/// A named pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pipeline {
    pub name: String,
    pub arguments: Vec<ArgumentSpec>,
    pub body: Vec<Instruction>,
}

/// All pipelines of one description document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineSet {
    pipelines: Vec<Pipeline>,
}

impl PipelineSet {
    /// Load a description from a file.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(Error::invalid_pipeline(format!(
                "pipeline file {} not found",
                path.display()
            )));
        }
        let doc = DocumentNode::read(path)
            .map_err(|e| Error::invalid_pipeline(format!("{}: {e}", path.display())))?;
        Self::parse(doc)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let doc: DocumentNode = serde_json::from_str(json)
            .map_err(|e| Error::invalid_pipeline(e.to_string()))?;
        Self::parse(doc)
    }

    pub fn parse(doc: DocumentNode) -> Result<Self> {
        let mut pipelines = Vec::new();
        for child in doc.children {
            if child.tag != "Pipeline" {
                return Err(Error::invalid_pipeline(format!(
                    "expected Pipeline, found {}",
                    child.tag
                )));
            }
            pipelines.push(parse_pipeline(child)?);
        }
        Ok(Self { pipelines })
    }

    /// The pipeline called `name`, or the first one.
    pub fn select(&self, name: Option<&str>) -> Result<&Pipeline> {
        let found = match name {
            Some(name) => self.pipelines.iter().find(|p| p.name == name),
            None => self.pipelines.first(),
        };
        found.ok_or_else(|| Error::PipelineNotFound {
            name: name.unwrap_or("<first>").to_string(),
        })
    }

    pub fn pipelines(&self) -> &[Pipeline] {
        &self.pipelines
    }
}

fn parse_pipeline(doc: DocumentNode) -> Result<Pipeline> {
    let name = doc
        .attributes
        .get("Name")
        .ok_or_else(|| Error::invalid_pipeline("Pipeline without Name"))?
        .to_string();

    let mut arguments = Vec::new();
    let mut body = Vec::new();
    for child in doc.children {
        if child.tag == "Arguments" {
            arguments.extend(parse_arguments(&child)?);
        } else if let Some(instruction) = parse_instruction(child)? {
            body.push(instruction);
        }
    }

    Ok(Pipeline {
        name,
        arguments,
        body,
    })
}

fn parse_arguments(doc: &DocumentNode) -> Result<Vec<ArgumentSpec>> {
    doc.children
        .iter()
        .map(|child| {
            if child.tag != "Argument" {
                return Err(Error::invalid_pipeline(format!(
                    "expected Argument, found {}",
                    child.tag
                )));
            }
            Ok(ArgumentSpec {
                name: required(&child.attributes, "Argument", "Name")?,
                default: child.attributes.get("Default").map(str::to_string),
                help: child.attributes.get("Help").map(str::to_string),
            })
        })
        .collect()
}

fn required(attributes: &Attributes, tag: &str, name: &str) -> Result<String> {
    attributes
        .get(name)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or_else(|| Error::invalid_pipeline(format!("{tag} requires {name}")))
}

fn optional(attributes: &Attributes, name: &str) -> Option<String> {
    attributes
        .get(name)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn parse_body(children: Vec<DocumentNode>) -> Result<Vec<Instruction>> {
    let mut body = Vec::new();
    for child in children {
        if let Some(instruction) = parse_instruction(child)? {
            body.push(instruction);
        }
    }
    Ok(body)
}

fn parse_instruction(doc: DocumentNode) -> Result<Option<Instruction>> {
    let attrs = &doc.attributes;
    let instruction = match doc.tag.as_str() {
        "Select" => {
            let clean_if_invalid = match attrs.get("CleanIfInvalid") {
                None | Some("") => true,
                Some(value) => bool::from_attribute(value).ok_or_else(|| {
                    Error::invalid_pipeline(format!("CleanIfInvalid must be a boolean, got {value:?}"))
                })?,
            };
            Instruction::Select {
                xpath: required(attrs, "Select", "XPath")?,
                root: optional(attrs, "Root"),
                variable: required(attrs, "Select", "VariableName")?,
                clean_if_invalid,
            }
        }
        "Iterate" => Instruction::Iterate {
            xpath: required(attrs, "Iterate", "XPath")?,
            root: optional(attrs, "Root"),
            variable: optional(attrs, "VariableName"),
            body: parse_body(doc.children)?,
        },
        "RequireMatch" => Instruction::RequireMatch {
            root: optional(attrs, "Root"),
            attribute: required(attrs, "RequireMatch", "Attribute")?,
            pattern: optional(attrs, "Pattern").unwrap_or_else(|| "*".to_string()),
        },
        "PythonCall" | "Call" => {
            let module = required(attrs, &doc.tag, "Module")?;
            let function = required(attrs, &doc.tag, "Function")?;
            let arguments = attrs
                .iter()
                .filter(|(name, _)| *name != "Module" && *name != "Function")
                .map(|(name, value)| (name.to_string(), value.to_string()))
                .collect();

            let mut parameters = Vec::new();
            for child in &doc.children {
                if child.tag != "Parameters" {
                    return Err(Error::invalid_pipeline(format!(
                        "{}.{} may only contain Parameters, found {}",
                        module, function, child.tag
                    )));
                }
                parameters.extend(
                    child
                        .attributes
                        .iter()
                        .map(|(name, value)| (name.to_string(), value.to_string())),
                );
            }

            Instruction::Call {
                module,
                function,
                arguments,
                parameters,
            }
        }
        // Consumed by the command line, not the interpreter.
        "Arguments" => return Ok(None),
        other => {
            return Err(Error::invalid_pipeline(format!(
                "unknown instruction {other}"
            )));
        }
    };
    Ok(Some(instruction))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    const DESCRIPTION: &str = r##"{
        "tag": "Pipelines",
        "children": [
            {
                "tag": "Pipeline",
                "attributes": {"Name": "Prune"},
                "children": [
                    {"tag": "Arguments", "children": [
                        {"tag": "Argument", "attributes": {"Name": "Filter", "Default": "Leveled", "Help": "Filter to use"}}
                    ]},
                    {"tag": "Iterate", "attributes": {"XPath": "Section", "VariableName": "SectionNode"}, "children": [
                        {"tag": "RequireMatch", "attributes": {"Attribute": "Name", "Pattern": "#Filter.*"}},
                        {"tag": "Select", "attributes": {"XPath": "Transform[@Name='Grid']", "VariableName": "Input", "CleanIfInvalid": "False"}},
                        {"tag": "PythonCall", "attributes": {"Module": "core", "Function": "run", "Input": "#Input"}, "children": [
                            {"tag": "Parameters", "attributes": {"Program": "register", "Path": "out.mosaic"}}
                        ]}
                    ]}
                ]
            },
            {"tag": "Pipeline", "attributes": {"Name": "Empty"}}
        ]
    }"##;

    #[test]
    fn test_parse_description() {
        let set = PipelineSet::from_json(DESCRIPTION).unwrap();
        assert_eq!(set.pipelines().len(), 2);

        let pipeline = set.select(None).unwrap();
        assert_eq!(pipeline.name, "Prune");
        assert_eq!(
            pipeline.arguments,
            vec![ArgumentSpec {
                name: "Filter".to_string(),
                default: Some("Leveled".to_string()),
                help: Some("Filter to use".to_string()),
            }]
        );
        assert_eq!(pipeline.body.len(), 1);

        let Instruction::Iterate { body, variable, .. } = &pipeline.body[0] else {
            panic!("expected Iterate");
        };
        assert_eq!(variable.as_deref(), Some("SectionNode"));
        assert_eq!(body.len(), 3);
        assert!(matches!(
            &body[1],
            Instruction::Select {
                clean_if_invalid: false,
                ..
            }
        ));
        let Instruction::Call {
            module,
            function,
            arguments,
            parameters,
        } = &body[2]
        else {
            panic!("expected Call");
        };
        assert_eq!((module.as_str(), function.as_str()), ("core", "run"));
        assert_eq!(arguments, &vec![("Input".to_string(), "#Input".to_string())]);
        assert_eq!(parameters.len(), 2);
    }

    #[test]
    fn test_select_by_name() {
        let set = PipelineSet::from_json(DESCRIPTION).unwrap();
        assert_eq!(set.select(Some("Empty")).unwrap().body.len(), 0);
        assert!(matches!(
            set.select(Some("Missing")),
            Err(Error::PipelineNotFound { .. })
        ));
    }

    #[test]
    fn test_unknown_instruction_is_rejected() {
        let json = r#"{"tag":"Pipelines","children":[{"tag":"Pipeline","attributes":{"Name":"x"},"children":[{"tag":"Loop"}]}]}"#;
        let err = PipelineSet::from_json(json).unwrap_err();
        assert!(matches!(err, Error::InvalidPipeline { .. }));
        assert!(err.is_configuration());
    }

    #[test]
    fn test_missing_required_attribute() {
        let json = r#"{"tag":"Pipelines","children":[{"tag":"Pipeline","attributes":{"Name":"x"},"children":[{"tag":"Select","attributes":{"XPath":"Section"}}]}]}"#;
        assert!(matches!(
            PipelineSet::from_json(json),
            Err(Error::InvalidPipeline { .. })
        ));
    }

    #[test]
    fn test_load_missing_file_is_configuration_error() {
        let temp_dir = TempDir::new().unwrap();
        let err = PipelineSet::load(&temp_dir.path().join("Pipelines.json")).unwrap_err();
        assert!(err.is_configuration());

        let path = temp_dir.path().join("Pipelines.json");
        fs::write(&path, DESCRIPTION).unwrap();
        assert_eq!(PipelineSet::load(&path).unwrap().pipelines().len(), 2);
    }
}
