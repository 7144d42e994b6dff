//! Demo unit binary - a handful of hand-written tools on the guest SDK
//!
//! Used by the integration tests and as a smoke test for a supervisor:
//! `demo_tools <host-port>`.

#![allow(non_snake_case)]

use std::process::ExitCode;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use toolsmith::guest::{Tool, ToolContext, ToolHost};

/// Adds two numbers.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Add {
    pub A: f64,
    pub B: f64,
    pub Out_Sum: f64,
}

impl Tool for Add {
    fn run(&mut self, _ctx: &ToolContext) -> Result<(), String> {
        self.Out_Sum = self.A + self.B;
        Ok(())
    }
}

/// Counts up to `Steps`, reporting progress; stops when cancelled.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Slow {
    pub Steps: u32,
    pub DelayMs: u64,
    pub Out_Done: u32,
}

impl Tool for Slow {
    fn run(&mut self, ctx: &ToolContext) -> Result<(), String> {
        let steps = self.Steps.max(1);
        for step in 0..steps {
            if !ctx.progress(f64::from(step) / f64::from(steps), "counting") {
                return Err("cancelled".to_string());
            }
            std::thread::sleep(Duration::from_millis(self.DelayMs));
            self.Out_Done = step + 1;
        }
        Ok(())
    }
}

/// Sums a list by calling `Add` for each element.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SumAll {
    pub Values: Vec<f64>,
    pub Out_Total: f64,
}

impl Tool for SumAll {
    fn run(&mut self, ctx: &ToolContext) -> Result<(), String> {
        let mut total = 0.0;
        for value in &self.Values {
            let out = ctx.call_tool("", "Add", json!({ "A": total, "B": value }))?;
            total = out["Out_Sum"].as_f64().ok_or("Add returned no Out_Sum")?;
        }
        ctx.print(&format!("summed {} values", self.Values.len()));
        self.Out_Total = total;
        Ok(())
    }
}

/// A counter with a UI; `change` adds `{"add": n}`.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Counter {
    pub Start: i64,
    pub Out_Value: i64,
}

impl Tool for Counter {
    fn run(&mut self, ctx: &ToolContext) -> Result<(), String> {
        self.Out_Value = self.Start;
        ctx.add_cmds(b"counter:started;");
        ctx.flush_cmds();
        ctx.add_cmds(b"counter:ready;");
        Ok(())
    }

    fn ui(&self) -> Vec<u8> {
        format!("[{}]", self.Out_Value).into_bytes()
    }

    fn change(&mut self, ctx: &ToolContext, change: &Value) -> Result<(), String> {
        let add = change["add"].as_i64().ok_or("change needs an integer `add`")?;
        self.Out_Value += add;
        ctx.add_cmds(format!("counter:{};", self.Out_Value).as_bytes());
        Ok(())
    }

    fn update(&mut self, _ctx: &ToolContext, sub_id: u64) -> Result<Vec<u8>, String> {
        Ok(format!("{sub_id}:[{}]", self.Out_Value).into_bytes())
    }
}

/// Reads a secret and reports its length.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SecretLength {
    pub Alias: String,
    pub Out_Length: usize,
}

impl Tool for SecretLength {
    fn run(&mut self, ctx: &ToolContext) -> Result<(), String> {
        self.Out_Length = ctx.secret(&self.Alias).len();
        Ok(())
    }
}

/// Asks the host before touching the network.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Fetch {
    pub Url: String,
    pub Out_Blocked: bool,
}

impl Tool for Fetch {
    fn run(&mut self, ctx: &ToolContext) -> Result<(), String> {
        self.Out_Blocked = ctx.report_violation("network", &self.Url);
        Ok(())
    }
}

/// Always fails.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Fail {}

impl Tool for Fail {
    fn run(&mut self, _ctx: &ToolContext) -> Result<(), String> {
        Err("this tool always fails".to_string())
    }
}

fn main() -> ExitCode {
    let mut host = ToolHost::new("Demo");
    host.register::<Add>("Add")
        .register::<Slow>("Slow")
        .register::<SumAll>("SumAll")
        .register::<Counter>("Counter")
        .register::<SecretLength>("SecretLength")
        .register::<Fetch>("Fetch")
        .register::<Fail>("Fail");
    host.run_from_args()
}
