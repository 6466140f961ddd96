use super::*;

use std::time::Duration;

use serde_json::json;

mod support;
use support::*;

mod term;
