// Copyright 2025 birpc Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Demo components exposed by `birpc serve`.

use birpc_common::{Params, Result, RpcError};
use birpc_server::Exposed;
use serde_json::{json, Value};
use std::time::Duration;

/// Longest sleep `Echo.delay` accepts.
pub const MAX_DELAY_MS: u64 = 60_000;

/// Integer arithmetic when both operands are integers and the result fits,
/// floating point otherwise.
fn arithmetic(
    params: &Params,
    integer: fn(i64, i64) -> Option<i64>,
    float: fn(f64, f64) -> f64,
) -> Result<Value> {
    let ints = (
        params.get(0).and_then(Value::as_i64),
        params.get(1).and_then(Value::as_i64),
    );
    if let (Some(a), Some(b)) = ints {
        if let Some(value) = integer(a, b) {
            return Ok(json!(value));
        }
    }
    Ok(json!(float(params.arg::<f64>(0)?, params.arg::<f64>(1)?)))
}

/// `Calc.add`, `Calc.subtract`, `Calc.multiply` and `Calc.divide`.
pub fn calc() -> Exposed {
    Exposed::new("Calc")
        .method("add", |p| arithmetic(&p, i64::checked_add, |a, b| a + b))
        .method("subtract", |p| arithmetic(&p, i64::checked_sub, |a, b| a - b))
        .method("multiply", |p| arithmetic(&p, i64::checked_mul, |a, b| a * b))
        .method("divide", |p| {
            let divisor = p.arg::<f64>(1)?;
            if divisor == 0.0 {
                return Err(RpcError::Handler("division by zero".to_string()));
            }
            Ok(p.arg::<f64>(0)? / divisor)
        })
}

/// `Echo.echo` returns its arguments; `Echo.delay` sleeps first.
pub fn echo() -> Exposed {
    Exposed::new("Echo")
        .method("echo", |p| Ok(echoed(p)))
        .async_method("delay", |p| async move {
            let ms = p.arg::<u64>(0)?;
            if ms > MAX_DELAY_MS {
                return Err(RpcError::InvalidParams(format!(
                    "delay of {}ms exceeds {}ms",
                    ms, MAX_DELAY_MS
                )));
            }
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok(echoed(Params::new(p.into_vec().into_iter().skip(1).collect())))
        })
}

// a single argument comes back bare, several as an array
fn echoed(params: Params) -> Value {
    let mut args = params.into_vec();
    match args.len() {
        0 => Value::Null,
        1 => args.remove(0),
        _ => Value::Array(args),
    }
}
