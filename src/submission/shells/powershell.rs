//
// Copyright (c) 2020-2021 science+computing ag and other contributors
//
// This program and the accompanying materials are made
// available under the terms of the Eclipse Public License 2.0
// which is available at https://www.eclipse.org/legal/epl-2.0/
//
// SPDX-License-Identifier: EPL-2.0
//

use std::collections::BTreeMap;
use std::fmt::Write as _;

use indoc::formatdoc;

use crate::error::{Error, Result};
use crate::submission::jobscript::EAR_FILES_DELIMITER;
use crate::submission::shells::{JobscriptComposeContext, Shell, APP_ALIAS, APP_CAPS};

const JS_INDENT: &str = "    ";

/// PowerShell on Windows. Scheduled submission is not supported for this
/// shell; jobscripts here always run through the direct executor.
#[derive(Clone, Debug)]
pub struct WindowsPowerShell {
    executable: String,
}

impl Default for WindowsPowerShell {
    fn default() -> Self {
        WindowsPowerShell {
            executable: String::from("powershell.exe"),
        }
    }
}

impl WindowsPowerShell {
    fn header(&self, ctx: &JobscriptComposeContext) -> String {
        formatdoc! {r#"
            $env:{caps}_WK_PATH = (Get-Location).Path
            $env:{caps}_SUB_IDX = "{sub_idx}"
            $env:{caps}_JS_IDX = "{js_idx}"
            $SubDir = Join-Path $env:{caps}_WK_PATH "submissions\{sub_idx}"
            $EarIdFile = Join-Path $SubDir "{ear_id_file}"
            $env:{caps}_JS_FUNCS_PATH = Join-Path $SubDir "{funcs_file}"
            . $env:{caps}_JS_FUNCS_PATH
            "#,
            caps = APP_CAPS,
            sub_idx = ctx.sub_idx,
            js_idx = ctx.js_idx,
            ear_id_file = ctx.ear_id_file_name,
            funcs_file = ctx.functions_file_name,
        }
    }

    fn wait_command(&self, pids: &[u32]) -> String {
        if pids.is_empty() {
            return String::new();
        }
        let pid_list = pids
            .iter()
            .map(|p| p.to_string())
            .collect::<Vec<_>>()
            .join(", ");
        formatdoc! {r#"
            foreach ($DepPid in @({pid_list})) {{
                Wait-Process -Id $DepPid -ErrorAction SilentlyContinue
            }}
            "#,
        }
    }

    fn main(&self, num_actions_expr: &str) -> String {
        formatdoc! {r#"
            $env:{caps}_JS_ELEM_IDX = "$JsElemIdx"
            $ElemEarIds = gantry_read_line $EarIdFile ($JsElemIdx + 1)
            for ($JsActIdx = 0; $JsActIdx -lt {num_actions}; $JsActIdx++) {{
                $EarId = ($ElemEarIds -split "{delim}")[$JsActIdx]
                if ($EarId -eq "-1") {{
                    continue
                }}
                $env:{caps}_RUN_ID = "$EarId"
                $env:{caps}_BLOCK_ACT_IDX = "$JsActIdx"
                $CmdFile = Join-Path $SubDir "scripts\js_$($env:{caps}_JS_IDX)_block_$($env:{caps}_BLOCK_IDX)_act_$($JsActIdx)_elem_$($JsElemIdx){ext}"
                {alias} internal workflow $env:{caps}_WK_PATH write-commands $env:{caps}_SUB_IDX $env:{caps}_JS_IDX $JsElemIdx $JsActIdx
                {alias} internal workflow $env:{caps}_WK_PATH set-ear-start $env:{caps}_SUB_IDX $env:{caps}_JS_IDX $JsElemIdx $JsActIdx
                . $CmdFile
                {alias} internal workflow $env:{caps}_WK_PATH set-ear-end $env:{caps}_SUB_IDX $env:{caps}_JS_IDX $JsElemIdx $JsActIdx $LASTEXITCODE
            }}
            "#,
            caps = APP_CAPS,
            alias = APP_ALIAS,
            num_actions = num_actions_expr,
            delim = EAR_FILES_DELIMITER,
            ext = self.js_ext(),
        }
    }

    fn element_loop(&self, num_elements_expr: &str, main: &str) -> String {
        formatdoc! {r#"
            for ($JsElemIdx = $BlockStartElemIdx; $JsElemIdx -lt ($BlockStartElemIdx + {num_elements}); $JsElemIdx++) {{
            {main}
            }}
            "#,
            num_elements = num_elements_expr,
            main = indent(main, JS_INDENT),
        }
    }
}

impl Shell for WindowsPowerShell {
    fn name(&self) -> &'static str {
        "powershell"
    }

    fn js_ext(&self) -> &'static str {
        ".ps1"
    }

    fn executable(&self) -> Vec<String> {
        vec![
            self.executable.clone(),
            String::from("-File"),
        ]
    }

    fn compose_jobscript(&self, ctx: &JobscriptComposeContext) -> String {
        let mut out = self.header(ctx);
        let wait = self.wait_command(&ctx.direct_wait_pids);
        if !wait.is_empty() {
            let _ = write!(out, "\n{}", wait);
        }

        if ctx.blocks.len() == 1 {
            let block = &ctx.blocks[0];
            let main = self.main(&block.num_actions().to_string());
            let _ = write!(
                out,
                "\n$env:{caps}_BLOCK_IDX = \"0\"\n$BlockStartElemIdx = 0\n\n",
                caps = APP_CAPS
            );
            if block.num_elements() == 1 {
                let _ = write!(out, "$JsElemIdx = 0\n{}", main);
            } else {
                let _ = write!(
                    out,
                    "{}",
                    self.element_loop(&block.num_elements().to_string(), &main)
                );
            }
        } else {
            let main = self.main("$NumActions[$BlockIdx]");
            let element_loop = self.element_loop("$NumElements[$BlockIdx]", &main);
            let num_elements = ctx
                .blocks
                .iter()
                .map(|b| b.num_elements().to_string())
                .collect::<Vec<_>>()
                .join(", ");
            let num_actions = ctx
                .blocks
                .iter()
                .map(|b| b.num_actions().to_string())
                .collect::<Vec<_>>()
                .join(", ");
            let _ = write!(
                out,
                "\n{}",
                formatdoc! {r#"
                    $NumElements = @({num_elements})
                    $NumActions = @({num_actions})
                    $BlockStartElemIdx = 0
                    for ($BlockIdx = 0; $BlockIdx -lt {num_blocks}; $BlockIdx++) {{
                        $env:{caps}_BLOCK_IDX = "$BlockIdx"
                    {element_loop}
                        $BlockStartElemIdx += $NumElements[$BlockIdx]
                    }}
                    "#,
                    caps = APP_CAPS,
                    num_elements = num_elements,
                    num_actions = num_actions,
                    num_blocks = ctx.blocks.len(),
                    element_loop = indent(&element_loop, JS_INDENT),
                }
            );
        }

        out.push('\n');
        out
    }

    fn compose_functions_file(&self, env_setup: Option<&str>, app_invocation: &str) -> String {
        let env_setup = match env_setup {
            Some(setup) if !setup.trim().is_empty() => {
                format!("{}\n", indent(setup.trim(), JS_INDENT))
            }
            _ => String::new(),
        };
        formatdoc! {r#"
            function {alias} {{
            {env_setup}{indent}& {app_invocation} $args
            }}

            function gantry_read_line($FilePath, $LineNumber) {{
                Get-Content $FilePath | Select-Object -Index ($LineNumber - 1)
            }}

            function gantry_join_path($Base, $Leaf) {{
                Join-Path $Base $Leaf
            }}
            "#,
            alias = APP_ALIAS,
            env_setup = env_setup,
            indent = JS_INDENT,
            app_invocation = app_invocation,
        }
    }

    fn format_stream_assignment(&self, var: &str, command: &str) -> String {
        format!("${} = {}", var, command)
    }

    fn format_save_parameter(&self, param_name: &str, var: &str) -> String {
        format!(
            "{alias} internal workflow $env:{caps}_WK_PATH save-parameter {param} \"${var}\" \
             $env:{caps}_SUB_IDX $env:{caps}_JS_IDX $env:{caps}_JS_ELEM_IDX $env:{caps}_BLOCK_ACT_IDX\n",
            alias = APP_ALIAS,
            caps = APP_CAPS,
            param = param_name,
            var = var,
        )
    }

    fn version_command(&self) -> Vec<String> {
        vec![
            self.executable.clone(),
            String::from("-Command"),
            String::from("$PSVersionTable.PSVersion.ToString()"),
        ]
    }

    fn parse_version_info(&self, stdout: &str) -> Result<BTreeMap<String, String>> {
        let version = stdout.trim();
        if version.is_empty() {
            return Err(Error::Runtime(String::from(
                "Failed to parse PowerShell version information",
            )));
        }
        let mut out = BTreeMap::new();
        out.insert(String::from("shell_name"), String::from("powershell"));
        out.insert(String::from("shell_executable"), self.executable.clone());
        out.insert(String::from("shell_version"), version.to_string());
        Ok(out)
    }
}

fn indent(text: &str, prefix: &str) -> String {
    text.lines()
        .map(|line| {
            if line.is_empty() {
                String::new()
            } else {
                format!("{}{}", prefix, line)
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::submission::jobscript::JobscriptBlockRecord;

    fn block(num_actions: usize, num_elements: usize) -> JobscriptBlockRecord {
        JobscriptBlockRecord {
            task_insert_ids: vec![0],
            task_actions: (0..num_actions).map(|a| (0, a, 0)).collect(),
            task_elements: BTreeMap::new(),
            task_loop_idx: vec![BTreeMap::new()],
            ear_ids: vec![vec![0; num_elements]; num_actions],
            dependencies: vec![],
        }
    }

    #[test]
    fn test_compose_basic() {
        let blocks = vec![block(1, 2)];
        let ps = WindowsPowerShell::default();
        let js = ps.compose_jobscript(&JobscriptComposeContext {
            sub_idx: 0,
            js_idx: 0,
            blocks: &blocks,
            is_array: false,
            is_scheduled: false,
            scheduler_directives: String::new(),
            scheduler_shebang_args: "",
            array_item_var: "",
            ear_id_file_name: String::from("js_0_EAR_IDs.txt"),
            functions_file_name: String::from("js_funcs_0.ps1"),
            direct_wait_pids: vec![7],
        });
        assert!(js.contains("$env:GANTRY_WK_PATH"));
        assert!(js.contains("Wait-Process -Id $DepPid"));
        assert!(js.contains("$LASTEXITCODE"));
        assert!(js.contains("for ($JsElemIdx"));
    }

    #[test]
    fn test_functions_file() {
        let ps = WindowsPowerShell::default();
        let funcs = ps.compose_functions_file(None, "gantry.exe");
        assert!(funcs.contains("function gantry_app"));
        assert!(funcs.contains("gantry_read_line"));
    }
}
