// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue and Binding Arguments
//!
//! Exchange, queue and binding declarations accept an argument table. In
//! configuration these are plain maps of `ArgValue`; this module converts them
//! into lapin field tables and injects the priority argument.

use lapin::types::{AMQPValue, FieldTable, LongInt, LongLongInt, LongString, ShortString};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Queue argument enabling priority delivery up to the given level
pub const AMQP_HEADERS_MAX_PRIORITY: &str = "x-max-priority";

/// A declaration argument value as it appears in configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ArgValue {
    Bool(bool),
    Int(i64),
    Str(String),
}

impl From<&ArgValue> for AMQPValue {
    fn from(value: &ArgValue) -> AMQPValue {
        match value {
            ArgValue::Bool(v) => AMQPValue::Boolean(*v),
            ArgValue::Int(v) => AMQPValue::LongLongInt(LongLongInt::from(*v)),
            ArgValue::Str(v) => AMQPValue::LongString(LongString::from(v.clone())),
        }
    }
}

/// Builds a field table out of configured arguments.
pub fn field_table(args: &BTreeMap<String, ArgValue>) -> FieldTable {
    let btree = args
        .iter()
        .map(|(key, value)| (ShortString::from(key.clone()), AMQPValue::from(value)))
        .collect::<BTreeMap<ShortString, AMQPValue>>();

    FieldTable::from(btree)
}

/// Adds `x-max-priority` to a queue declaration when a priority is requested.
///
/// A zero priority leaves the table untouched so the queue stays a plain FIFO.
pub fn with_priority(mut table: FieldTable, priority: u8) -> FieldTable {
    if priority > 0 {
        table.insert(
            ShortString::from(AMQP_HEADERS_MAX_PRIORITY),
            AMQPValue::LongInt(LongInt::from(priority)),
        );
    }

    table
}
