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

const JS_INDENT: &str = "  ";

/// bash on a POSIX OS.
#[derive(Clone, Debug)]
pub struct Bash {
    executable: String,
}

impl Default for Bash {
    fn default() -> Self {
        Bash {
            executable: String::from("/bin/bash"),
        }
    }
}

impl Bash {
    fn header(&self, ctx: &JobscriptComposeContext) -> String {
        formatdoc! {r#"
            export {caps}_WK_PATH=`pwd`
            export {caps}_SUB_IDX={sub_idx}
            export {caps}_JS_IDX={js_idx}
            SUB_DIR="${caps}_WK_PATH/submissions/${caps}_SUB_IDX"
            EAR_ID_FILE="$SUB_DIR/{ear_id_file}"
            export {caps}_JS_FUNCS_PATH="$SUB_DIR/{funcs_file}"
            . "${caps}_JS_FUNCS_PATH"
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
            .join(" ");
        formatdoc! {r#"
            for dep_pid in {pid_list}
            do
              while kill -0 "$dep_pid" 2> /dev/null
              do
                sleep 2
              done
            done
            "#,
        }
    }

    /// The per-element body: read the element's EAR-id line and run each
    /// action through the write-commands / set-ear-start / set-ear-end
    /// callbacks. `num_actions_expr` is a literal count or an array lookup.
    fn main(&self, num_actions_expr: &str) -> String {
        formatdoc! {r#"
            export {caps}_JS_ELEM_IDX=$JS_elem_idx
            elem_EAR_IDs=`gantry_read_line "$EAR_ID_FILE" $(($JS_elem_idx + 1))`
            for ((JS_act_idx=0; JS_act_idx<{num_actions}; JS_act_idx++))
            do
              EAR_ID="$(cut -d'{delim}' -f $(($JS_act_idx + 1)) <<< "$elem_EAR_IDs")"
              if [ "$EAR_ID" = "-1" ]; then
                continue
              fi
              export {caps}_RUN_ID=$EAR_ID
              export {caps}_BLOCK_ACT_IDX=$JS_act_idx
              cmd_file="$SUB_DIR/scripts/js_${{{caps}_JS_IDX}}_block_${{{caps}_BLOCK_IDX}}_act_${{JS_act_idx}}_elem_${{JS_elem_idx}}{ext}"
              {alias} internal workflow "${caps}_WK_PATH" write-commands "${caps}_SUB_IDX" "${caps}_JS_IDX" "$JS_elem_idx" "$JS_act_idx"
              {alias} internal workflow "${caps}_WK_PATH" set-ear-start "${caps}_SUB_IDX" "${caps}_JS_IDX" "$JS_elem_idx" "$JS_act_idx"
              . "$cmd_file"
              {alias} internal workflow "${caps}_WK_PATH" set-ear-end "${caps}_SUB_IDX" "${caps}_JS_IDX" "$JS_elem_idx" "$JS_act_idx" "$?"
            done
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
            for ((JS_elem_idx=$block_start_elem_idx; JS_elem_idx<$(($block_start_elem_idx + {num_elements})); JS_elem_idx++))
            do
            {main}
            done
            "#,
            num_elements = num_elements_expr,
            main = indent(main, JS_INDENT),
        }
    }

    fn format_array(&self, values: &[usize]) -> String {
        format!(
            "({})",
            values
                .iter()
                .map(|v| v.to_string())
                .collect::<Vec<_>>()
                .join(" ")
        )
    }
}

impl Shell for Bash {
    fn name(&self) -> &'static str {
        "bash"
    }

    fn js_ext(&self) -> &'static str {
        ".sh"
    }

    fn executable(&self) -> Vec<String> {
        vec![self.executable.clone()]
    }

    fn compose_jobscript(&self, ctx: &JobscriptComposeContext) -> String {
        let mut out = format!("#!{}", self.executable);
        if !ctx.scheduler_shebang_args.is_empty() {
            let _ = write!(out, " {}", ctx.scheduler_shebang_args);
        }
        out.push('\n');

        if ctx.is_scheduled {
            let _ = write!(out, "\n{}\n", ctx.scheduler_directives);
        }
        let _ = write!(out, "\n{}", self.header(ctx));
        if !ctx.is_scheduled {
            let wait = self.wait_command(&ctx.direct_wait_pids);
            if !wait.is_empty() {
                let _ = write!(out, "\n{}", wait);
            }
        }

        if ctx.blocks.len() == 1 {
            let block = &ctx.blocks[0];
            let main = self.main(&block.num_actions().to_string());
            let _ = write!(
                out,
                "\nexport {caps}_BLOCK_IDX=0\nblock_start_elem_idx=0\n\n",
                caps = APP_CAPS
            );
            if ctx.is_array {
                let _ = write!(
                    out,
                    "JS_elem_idx=$(( ${} - 1 ))\n{}",
                    ctx.array_item_var, main
                );
            } else if block.num_elements() == 1 {
                let _ = write!(out, "JS_elem_idx=0\n{}", main);
            } else {
                let _ = write!(
                    out,
                    "{}",
                    self.element_loop(&block.num_elements().to_string(), &main)
                );
            }
        } else {
            // outer block loop with per-block element and action counts
            let main = self.main("${num_actions[$block_idx]}");
            let element_loop = self.element_loop("${num_elements[$block_idx]}", &main);
            let num_elements: Vec<usize> =
                ctx.blocks.iter().map(|b| b.num_elements()).collect();
            let num_actions: Vec<usize> = ctx.blocks.iter().map(|b| b.num_actions()).collect();
            let _ = write!(
                out,
                "\n{}",
                formatdoc! {r#"
                    num_elements={num_elements}
                    num_actions={num_actions}
                    block_start_elem_idx=0
                    for ((block_idx=0; block_idx<{num_blocks}; block_idx++))
                    do
                      export {caps}_BLOCK_IDX=$block_idx
                    {element_loop}
                      block_start_elem_idx=$(($block_start_elem_idx + ${{num_elements[$block_idx]}}))
                    done
                    "#,
                    caps = APP_CAPS,
                    num_elements = self.format_array(&num_elements),
                    num_actions = self.format_array(&num_actions),
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
            #!{executable}

            {alias} () {{
            (
            {env_setup}{indent}{app_invocation} "$@"
            )
            }}

            gantry_read_line () {{
              sed "$2q;d" "$1"
            }}

            gantry_join_path () {{
              printf '%s/%s' "${{1%/}}" "$2"
            }}
            "#,
            executable = self.executable,
            alias = APP_ALIAS,
            env_setup = env_setup,
            indent = JS_INDENT,
            app_invocation = app_invocation,
        }
    }

    fn format_stream_assignment(&self, var: &str, command: &str) -> String {
        format!("{}=`{}`", var, command)
    }

    fn format_save_parameter(&self, param_name: &str, var: &str) -> String {
        format!(
            "{alias} internal workflow \"${caps}_WK_PATH\" save-parameter {param} \"${var}\" \
             \"${caps}_SUB_IDX\" \"${caps}_JS_IDX\" \"${caps}_JS_ELEM_IDX\" \"${caps}_BLOCK_ACT_IDX\"\n",
            alias = APP_ALIAS,
            caps = APP_CAPS,
            param = param_name,
            var = var,
        )
    }

    fn version_command(&self) -> Vec<String> {
        vec![self.executable.clone(), String::from("--version")]
    }

    fn parse_version_info(&self, stdout: &str) -> Result<BTreeMap<String, String>> {
        // e.g. "GNU bash, version 5.1.16(1)-release (x86_64-pc-linux-gnu)"
        let version = stdout
            .lines()
            .next()
            .and_then(|line| line.split_whitespace().nth(3))
            .ok_or_else(|| {
                Error::Runtime(String::from("Failed to parse bash version information"))
            })?;
        let mut out = BTreeMap::new();
        out.insert(String::from("shell_name"), String::from("bash"));
        out.insert(String::from("shell_executable"), self.executable.clone());
        out.insert(String::from("shell_version"), version.to_string());
        Ok(out)
    }
}

/// bash run through WSL on Windows.
#[derive(Clone, Debug, Default)]
pub struct WslBash {
    inner: Bash,
    wsl_executable: Option<String>,
    wsl_distribution: Option<String>,
    wsl_user: Option<String>,
}

impl WslBash {
    fn wsl_command(&self) -> Vec<String> {
        let mut out = vec![self
            .wsl_executable
            .clone()
            .unwrap_or_else(|| String::from("wsl"))];
        if let Some(dist) = &self.wsl_distribution {
            out.push(String::from("--distribution"));
            out.push(dist.clone());
        }
        if let Some(user) = &self.wsl_user {
            out.push(String::from("--user"));
            out.push(user.clone());
        }
        out
    }
}

impl Shell for WslBash {
    fn name(&self) -> &'static str {
        "wsl+bash"
    }

    fn js_ext(&self) -> &'static str {
        self.inner.js_ext()
    }

    fn executable(&self) -> Vec<String> {
        let mut out = self.wsl_command();
        out.extend(self.inner.executable());
        out
    }

    fn compose_jobscript(&self, ctx: &JobscriptComposeContext) -> String {
        self.inner.compose_jobscript(ctx)
    }

    fn compose_functions_file(&self, env_setup: Option<&str>, app_invocation: &str) -> String {
        self.inner.compose_functions_file(env_setup, app_invocation)
    }

    fn format_stream_assignment(&self, var: &str, command: &str) -> String {
        self.inner.format_stream_assignment(var, command)
    }

    fn format_save_parameter(&self, param_name: &str, var: &str) -> String {
        self.inner.format_save_parameter(param_name, var)
    }

    fn version_command(&self) -> Vec<String> {
        let mut out = self.wsl_command();
        out.extend(self.inner.version_command());
        out
    }

    fn parse_version_info(&self, stdout: &str) -> Result<BTreeMap<String, String>> {
        let mut out = self.inner.parse_version_info(stdout)?;
        out.insert(String::from("shell_name"), String::from("wsl+bash"));
        out.insert(
            String::from("WSL_executable"),
            self.wsl_command().join(" "),
        );
        Ok(out)
    }

    fn prepare_js_path(&self, path: &std::path::Path) -> String {
        // translate C:\... to /mnt/c/... for execution inside WSL
        let text = path.display().to_string().replace('\\', "/");
        match text.split_once(":/") {
            Some((drive, rest)) if drive.len() == 1 => {
                format!("/mnt/{}/{}", drive.to_lowercase(), rest)
            }
            _ => text,
        }
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

    fn ctx<'a>(
        blocks: &'a [JobscriptBlockRecord],
        is_array: bool,
        is_scheduled: bool,
    ) -> JobscriptComposeContext<'a> {
        JobscriptComposeContext {
            sub_idx: 0,
            js_idx: 1,
            blocks,
            is_array,
            is_scheduled,
            scheduler_directives: if is_scheduled {
                String::from("#SBATCH --ntasks 1")
            } else {
                String::new()
            },
            scheduler_shebang_args: "",
            array_item_var: "SLURM_ARRAY_TASK_ID",
            ear_id_file_name: String::from("js_1_EAR_IDs.txt"),
            functions_file_name: String::from("js_funcs_1.sh"),
            direct_wait_pids: vec![],
        }
    }

    #[test]
    fn test_single_element_no_loop() {
        let blocks = vec![block(1, 1)];
        let bash = Bash::default();
        let js = bash.compose_jobscript(&ctx(&blocks, false, false));
        assert!(js.starts_with("#!/bin/bash\n"));
        assert!(js.contains("JS_elem_idx=0"));
        assert!(!js.contains("for ((JS_elem_idx"));
        assert!(js.contains("write-commands"));
        assert!(js.contains("set-ear-start"));
        assert!(js.contains("set-ear-end"));
    }

    #[test]
    fn test_multi_element_loop() {
        let blocks = vec![block(2, 3)];
        let bash = Bash::default();
        let js = bash.compose_jobscript(&ctx(&blocks, false, false));
        assert!(js.contains("for ((JS_elem_idx=$block_start_elem_idx"));
        assert!(js.contains("JS_act_idx<2"));
    }

    #[test]
    fn test_array_uses_scheduler_variable() {
        let blocks = vec![block(1, 3)];
        let bash = Bash::default();
        let js = bash.compose_jobscript(&ctx(&blocks, true, true));
        assert!(js.contains("JS_elem_idx=$(( $SLURM_ARRAY_TASK_ID - 1 ))"));
        assert!(js.contains("#SBATCH --ntasks 1"));
    }

    #[test]
    fn test_multi_block_outer_loop() {
        let blocks = vec![block(1, 2), block(2, 1)];
        let bash = Bash::default();
        let js = bash.compose_jobscript(&ctx(&blocks, false, false));
        assert!(js.contains("num_elements=(2 1)"));
        assert!(js.contains("num_actions=(1 2)"));
        assert!(js.contains("for ((block_idx=0; block_idx<2"));
    }

    #[test]
    fn test_direct_wait_command() {
        let blocks = vec![block(1, 1)];
        let bash = Bash::default();
        let mut c = ctx(&blocks, false, false);
        c.direct_wait_pids = vec![4242];
        let js = bash.compose_jobscript(&c);
        assert!(js.contains("for dep_pid in 4242"));
        assert!(js.contains("kill -0"));
    }

    #[test]
    fn test_functions_file_contains_alias_and_helpers() {
        let bash = Bash::default();
        let funcs = bash.compose_functions_file(Some("module load gantry"), "gantry");
        assert!(funcs.contains("gantry_app () {"));
        assert!(funcs.contains("module load gantry"));
        assert!(funcs.contains("gantry_read_line"));
        assert!(funcs.contains("gantry_join_path"));
    }

    #[test]
    fn test_parse_version_info() {
        let bash = Bash::default();
        let info = bash
            .parse_version_info("GNU bash, version 5.1.16(1)-release (x86_64-pc-linux-gnu)\n")
            .unwrap();
        assert_eq!(info["shell_version"], "5.1.16(1)-release");
    }

    #[test]
    fn test_wsl_path_translation() {
        let wsl = WslBash::default();
        assert_eq!(
            wsl.prepare_js_path(std::path::Path::new("C:/wk/submissions/0/js_0.sh")),
            "/mnt/c/wk/submissions/0/js_0.sh"
        );
    }
}
