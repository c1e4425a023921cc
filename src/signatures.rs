//! Resolved file descriptors and the template layer that produces them.
//!
//! A [`FileDescriptor`] is what the scanner consumes: every variable slot is
//! already substituted and every expression compiled. Templates carry the
//! unresolved text form and are what the command line reads from JSON.

use ahash::AHashMap;
use serde::{Deserialize, Serialize};

use crate::checksum::ChecksumAlgorithm;
use crate::error::{CardError, Result};
use crate::header::Region;
use crate::matcher::patterns::substitute_text;
use crate::matcher::{ChecksumField, LengthField, LengthUnit, SearchExpression};

/// Value bound to a template variable
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VariableValue {
    Bytes(Vec<u8>),
    Number(u64),
}

impl VariableValue {
    /// `#123` is a decimal number, anything else is hex bytes (`4A50`)
    pub fn parse(text: &str) -> Result<Self> {
        if let Some(decimal) = text.strip_prefix('#') {
            return decimal
                .parse()
                .map(VariableValue::Number)
                .map_err(|_| CardError::Parse(format!("invalid decimal value {:?}", text)));
        }

        let hex: String = text.chars().filter(|c| !c.is_whitespace()).collect();
        if hex.is_empty() || !hex.is_ascii() || hex.len() % 2 != 0 {
            return Err(CardError::Parse(format!("invalid hex value {:?}", text)));
        }
        (0..hex.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&hex[i..i + 2], 16))
            .collect::<std::result::Result<Vec<u8>, _>>()
            .map(VariableValue::Bytes)
            .map_err(|_| CardError::Parse(format!("invalid hex value {:?}", text)))
    }

    pub fn as_number(&self) -> Option<u64> {
        match self {
            VariableValue::Number(n) => Some(*n),
            VariableValue::Bytes(_) => None,
        }
    }
}

/// Named values substituted into descriptor templates
#[derive(Debug, Clone, Default)]
pub struct Variables {
    values: AHashMap<String, VariableValue>,
}

impl Variables {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: VariableValue) -> Option<VariableValue> {
        self.values.insert(name.into(), value)
    }

    pub fn get(&self, name: &str) -> Option<&VariableValue> {
        self.values.get(name)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Parse a `name=value` assignment
    pub fn parse_assignment(text: &str) -> Result<(String, VariableValue)> {
        let (name, value) = text
            .split_once('=')
            .ok_or_else(|| CardError::Parse(format!("expected name=value, got {:?}", text)))?;
        let name = name.trim();
        let valid_name = name
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
            && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
        if !valid_name {
            return Err(CardError::Parse(format!("invalid variable name {:?}", name)));
        }
        Ok((name.to_string(), VariableValue::parse(value.trim())?))
    }
}

/// A resolved description of one recognisable file
#[derive(Debug, Clone)]
pub struct FileDescriptor {
    /// Game code plus optional maker code (`GALE` or `GALE01`); may be empty
    pub game_id: String,
    pub filename: String,
    pub expressions: Vec<SearchExpression>,
    pub length: Option<LengthField>,
    pub checksum: Option<ChecksumField>,
    /// Extent used when no length field is defined or readable
    pub min_blocks: u16,
    /// Higher values are tried first
    pub priority: i32,
}

impl FileDescriptor {
    pub fn new(game_id: impl Into<String>, filename: impl Into<String>, expression: SearchExpression) -> Self {
        Self {
            game_id: game_id.into(),
            filename: filename.into(),
            expressions: vec![expression],
            length: None,
            checksum: None,
            min_blocks: 1,
            priority: 0,
        }
    }

    pub fn with_expression(mut self, expression: SearchExpression) -> Self {
        self.expressions.push(expression);
        self
    }

    pub fn with_length(mut self, length: LengthField) -> Self {
        self.length = Some(length);
        self
    }

    pub fn with_checksum(mut self, checksum: ChecksumField) -> Self {
        self.checksum = Some(checksum);
        self
    }

    pub fn with_min_blocks(mut self, min_blocks: u16) -> Self {
        self.min_blocks = min_blocks;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// True when any expression matches at the start of `window`
    #[inline]
    pub fn matches(&self, window: &[u8]) -> bool {
        self.expressions.iter().any(|expr| expr.matches(window))
    }

    pub fn region(&self) -> Region {
        Region::from_game_code(self.game_id.as_bytes())
    }

    pub fn label(&self) -> String {
        if self.game_id.is_empty() {
            self.filename.clone()
        } else {
            format!("{}/{}", self.game_id, self.filename)
        }
    }

    pub fn validate(&self) -> Result<()> {
        let fail = |reason: &str| Err(CardError::Descriptor(format!("{}: {}", self.label(), reason)));

        if self.expressions.is_empty() {
            return fail("no search expression");
        }
        if self.min_blocks == 0 {
            return fail("minimum block count must be at least 1");
        }
        if !self.game_id.is_ascii() || self.game_id.len() > 6 {
            return fail("game id must be at most 6 ASCII characters");
        }
        if let Some(length) = &self.length {
            if !matches!(length.width, 1 | 2 | 4) {
                return fail("length field width must be 1, 2 or 4");
            }
            if length.scale == 0 {
                return fail("length field scale must be non-zero");
            }
        }
        Ok(())
    }
}

/// Length field scale: a constant or the name of a numeric variable
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScaleSpec {
    Fixed(u64),
    Variable(String),
}

impl Default for ScaleSpec {
    fn default() -> Self {
        ScaleSpec::Fixed(1)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LengthFieldTemplate {
    pub offset: usize,
    pub width: usize,
    pub unit: LengthUnit,
    #[serde(default)]
    pub scale: ScaleSpec,
}

fn default_min_blocks() -> u16 {
    1
}

/// Unresolved descriptor as stored in a descriptor list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DescriptorTemplate {
    #[serde(default)]
    pub game_id: String,
    pub filename: String,
    #[serde(default)]
    pub patterns: Vec<String>,
    #[serde(default)]
    pub regexes: Vec<String>,
    #[serde(default)]
    pub length: Option<LengthFieldTemplate>,
    #[serde(default)]
    pub checksum: Option<ChecksumField>,
    #[serde(default = "default_min_blocks")]
    pub min_blocks: u16,
    #[serde(default)]
    pub priority: i32,
}

impl DescriptorTemplate {
    /// Substitute variables and compile every expression
    pub fn resolve(&self, variables: &Variables) -> Result<FileDescriptor> {
        let context = |e: CardError| CardError::Descriptor(format!("{}: {}", self.filename, e));

        let mut expressions = Vec::with_capacity(self.patterns.len() + self.regexes.len());
        for text in &self.patterns {
            expressions.push(SearchExpression::pattern(text, variables).map_err(context)?);
        }
        for text in &self.regexes {
            expressions.push(SearchExpression::regex(text, variables).map_err(context)?);
        }

        let length = match &self.length {
            Some(template) => {
                let scale = match &template.scale {
                    ScaleSpec::Fixed(n) => *n,
                    ScaleSpec::Variable(name) => variables
                        .get(name)
                        .and_then(VariableValue::as_number)
                        .ok_or_else(|| {
                            CardError::Descriptor(format!(
                                "{}: scale variable {:?} is missing or not a number",
                                self.filename, name
                            ))
                        })?,
                };
                Some(LengthField {
                    offset: template.offset,
                    width: template.width,
                    unit: template.unit,
                    scale,
                })
            }
            None => None,
        };

        let descriptor = FileDescriptor {
            game_id: substitute_text(&self.game_id, variables).map_err(context)?,
            filename: substitute_text(&self.filename, variables).map_err(context)?,
            expressions,
            length,
            checksum: self.checksum,
            min_blocks: self.min_blocks,
            priority: self.priority,
        };
        descriptor.validate()?;
        Ok(descriptor)
    }
}

/// Ordered, validated descriptor list handed to the scanner
#[derive(Debug, Clone, Default)]
pub struct DescriptorSet {
    descriptors: Vec<FileDescriptor>,
}

impl DescriptorSet {
    pub fn new(descriptors: Vec<FileDescriptor>) -> Result<Self> {
        for descriptor in &descriptors {
            descriptor.validate()?;
        }
        Ok(Self { descriptors })
    }

    pub fn from_templates(templates: &[DescriptorTemplate], variables: &Variables) -> Result<Self> {
        let descriptors = templates
            .iter()
            .map(|template| template.resolve(variables))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { descriptors })
    }

    /// Parse a JSON array of templates and resolve it
    pub fn from_json(text: &str, variables: &Variables) -> Result<Self> {
        let templates: Vec<DescriptorTemplate> =
            serde_json::from_str(text).map_err(|e| CardError::Parse(format!("descriptor list: {}", e)))?;
        Self::from_templates(&templates, variables)
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&FileDescriptor> {
        self.descriptors.get(index)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, FileDescriptor> {
        self.descriptors.iter()
    }

    /// Descriptors usable on a card of `region`
    pub fn for_region(&self, region: Region) -> DescriptorSet {
        Self {
            descriptors: self
                .descriptors
                .iter()
                .filter(|d| d.region().is_compatible(region))
                .cloned()
                .collect(),
        }
    }

    /// Indices in the order the scanner tries them.
    ///
    /// Sorted by descending priority; ties keep declaration order. With a
    /// region, incompatible descriptors are left out.
    pub fn scan_order(&self, region: Option<Region>) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.descriptors.len())
            .filter(|&i| region.map_or(true, |r| self.descriptors[i].region().is_compatible(r)))
            .collect();
        order.sort_by_key(|&i| std::cmp::Reverse(self.descriptors[i].priority));
        order
    }
}

impl<'a> IntoIterator for &'a DescriptorSet {
    type Item = &'a FileDescriptor;
    type IntoIter = std::slice::Iter<'a, FileDescriptor>;

    fn into_iter(self) -> Self::IntoIter {
        self.descriptors.iter()
    }
}

/// Trailing CRC-32 over everything before it, a common save layout
pub fn trailing_crc32() -> ChecksumField {
    use crate::matcher::FieldLocation;
    ChecksumField {
        algorithm: ChecksumAlgorithm::Crc32,
        stored_at: FieldLocation::FromEnd(4),
        covered_from: FieldLocation::FromStart(0),
        covered_to: FieldLocation::FromEnd(4),
    }
}
