//! pprof `profile.proto` messages and a builder for the snapshot profiles.
//!
//! Only the fields the snapshot writers fill in are declared; tags match
//! `perftools.profiles.Profile` so any pprof reader accepts the output.

use prost::Message;
use std::collections::HashMap;
use std::io::{self, Write};
use std::time::Duration;

#[derive(Clone, PartialEq, Message)]
pub struct Profile {
    #[prost(message, repeated, tag = "1")]
    pub sample_type: Vec<ValueType>,
    #[prost(message, repeated, tag = "2")]
    pub sample: Vec<Sample>,
    #[prost(message, repeated, tag = "4")]
    pub location: Vec<Location>,
    #[prost(message, repeated, tag = "5")]
    pub function: Vec<Function>,
    #[prost(string, repeated, tag = "6")]
    pub string_table: Vec<String>,
    #[prost(int64, tag = "9")]
    pub time_nanos: i64,
    #[prost(int64, tag = "10")]
    pub duration_nanos: i64,
    #[prost(message, optional, tag = "11")]
    pub period_type: Option<ValueType>,
    #[prost(int64, tag = "12")]
    pub period: i64,
    #[prost(int64, repeated, tag = "13")]
    pub comment: Vec<i64>,
    #[prost(int64, tag = "14")]
    pub default_sample_type: i64,
}

#[derive(Clone, PartialEq, Message)]
pub struct ValueType {
    #[prost(int64, tag = "1")]
    pub r#type: i64,
    #[prost(int64, tag = "2")]
    pub unit: i64,
}

#[derive(Clone, PartialEq, Message)]
pub struct Sample {
    #[prost(uint64, repeated, tag = "1")]
    pub location_id: Vec<u64>,
    #[prost(int64, repeated, tag = "2")]
    pub value: Vec<i64>,
    #[prost(message, repeated, tag = "3")]
    pub label: Vec<Label>,
}

#[derive(Clone, PartialEq, Message)]
pub struct Label {
    #[prost(int64, tag = "1")]
    pub key: i64,
    #[prost(int64, tag = "2")]
    pub str: i64,
    #[prost(int64, tag = "3")]
    pub num: i64,
    #[prost(int64, tag = "4")]
    pub num_unit: i64,
}

#[derive(Clone, PartialEq, Message)]
pub struct Location {
    #[prost(uint64, tag = "1")]
    pub id: u64,
    #[prost(uint64, tag = "2")]
    pub mapping_id: u64,
    #[prost(uint64, tag = "3")]
    pub address: u64,
    #[prost(message, repeated, tag = "4")]
    pub line: Vec<Line>,
}

#[derive(Clone, PartialEq, Message)]
pub struct Line {
    #[prost(uint64, tag = "1")]
    pub function_id: u64,
    #[prost(int64, tag = "2")]
    pub line: i64,
}

#[derive(Clone, PartialEq, Message)]
pub struct Function {
    #[prost(uint64, tag = "1")]
    pub id: u64,
    #[prost(int64, tag = "2")]
    pub name: i64,
    #[prost(int64, tag = "3")]
    pub system_name: i64,
    #[prost(int64, tag = "4")]
    pub filename: i64,
    #[prost(int64, tag = "5")]
    pub start_line: i64,
}

impl Profile {
    pub fn write_to(&self, writer: &mut impl Write) -> io::Result<()> {
        writer.write_all(&self.encode_to_vec())
    }

    pub fn string_at(&self, index: i64) -> &str {
        usize::try_from(index)
            .ok()
            .and_then(|i| self.string_table.get(i))
            .map(String::as_str)
            .unwrap_or("")
    }

    pub fn sample_type_names(&self) -> Vec<&str> {
        self.sample_type
            .iter()
            .map(|t| self.string_at(t.r#type))
            .collect()
    }

    /// Sum of the `index`th value over all samples
    pub fn total(&self, index: usize) -> i64 {
        self.sample
            .iter()
            .filter_map(|s| s.value.get(index))
            .sum()
    }

    /// Function name of every location, keyed by location id
    pub fn location_names(&self) -> HashMap<u64, String> {
        let functions: HashMap<u64, &Function> =
            self.function.iter().map(|f| (f.id, f)).collect();
        self.location
            .iter()
            .filter_map(|loc| {
                let function = functions.get(&loc.line.first()?.function_id)?;
                Some((loc.id, self.string_at(function.name).to_string()))
            })
            .collect()
    }
}

/// Builds a [`Profile`], interning strings, functions and locations
pub struct ProfileBuilder {
    profile: Profile,
    strings: HashMap<String, i64>,
    functions: HashMap<(i64, i64), u64>,
    locations: HashMap<(u64, i64), u64>,
}

impl ProfileBuilder {
    /// `sample_types` and `period_type` are (type, unit) pairs, e.g.
    /// `("inuse_space", "bytes")`.
    pub fn new(sample_types: &[(&str, &str)], period_type: (&str, &str), period: i64) -> Self {
        let mut builder = ProfileBuilder {
            profile: Profile::default(),
            strings: HashMap::new(),
            functions: HashMap::new(),
            locations: HashMap::new(),
        };
        // Index 0 of the string table must be the empty string
        builder.string("");

        let mut types = Vec::with_capacity(sample_types.len());
        for (ty, unit) in sample_types {
            types.push(builder.value_type(ty, unit));
        }
        builder.profile.sample_type = types;
        builder.profile.period_type = Some(builder.value_type(period_type.0, period_type.1));
        builder.profile.period = period;
        builder.profile.time_nanos = chrono::Utc::now().timestamp_nanos_opt().unwrap_or(0);
        builder
    }

    fn value_type(&mut self, ty: &str, unit: &str) -> ValueType {
        ValueType {
            r#type: self.string(ty),
            unit: self.string(unit),
        }
    }

    pub fn string(&mut self, value: &str) -> i64 {
        if let Some(&index) = self.strings.get(value) {
            return index;
        }
        let index = self.profile.string_table.len() as i64;
        self.profile.string_table.push(value.to_string());
        self.strings.insert(value.to_string(), index);
        index
    }

    pub fn default_sample_type(&mut self, ty: &str) -> &mut Self {
        self.profile.default_sample_type = self.string(ty);
        self
    }

    pub fn comment(&mut self, text: &str) -> &mut Self {
        let index = self.string(text);
        self.profile.comment.push(index);
        self
    }

    pub fn duration(&mut self, duration: Duration) -> &mut Self {
        self.profile.duration_nanos = i64::try_from(duration.as_nanos()).unwrap_or(i64::MAX);
        self
    }

    /// Location id for `function` at `file:line`, creating it on first use.
    pub fn location(&mut self, function: &str, file: &str, line: i64) -> u64 {
        let name = self.string(function);
        let filename = self.string(file);
        let next_function = self.functions.len() as u64 + 1;
        let function_id = *self.functions.entry((name, filename)).or_insert(next_function);
        if function_id == next_function {
            self.profile.function.push(Function {
                id: function_id,
                name,
                system_name: name,
                filename,
                start_line: 0,
            });
        }

        let next_location = self.locations.len() as u64 + 1;
        let location_id = *self
            .locations
            .entry((function_id, line))
            .or_insert(next_location);
        if location_id == next_location {
            self.profile.location.push(Location {
                id: location_id,
                mapping_id: 0,
                address: 0,
                line: vec![Line { function_id, line }],
            });
        }
        location_id
    }

    /// Add a sample. `locations` is leaf first.
    pub fn sample(&mut self, locations: Vec<u64>, values: Vec<i64>, labels: &[(&str, &str)]) {
        let label = labels
            .iter()
            .map(|(key, value)| Label {
                key: self.string(key),
                str: self.string(value),
                num: 0,
                num_unit: 0,
            })
            .collect();
        self.profile.sample.push(Sample {
            location_id: locations,
            value: values,
            label,
        });
    }

    pub fn build(self) -> Profile {
        self.profile
    }
}
