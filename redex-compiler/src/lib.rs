// SPDX-FileCopyrightText: 2023 Marshall Wace <opensource@mwam.com>
// SPDX-License-Identifier: Apache-2.0
// SPDX-FileContributor: Tim Kendrick <t.kendrick@mwam.com> https://github.com/timkendrickmw
use serde::{Deserialize, Serialize};

pub mod bytecode;
pub mod codegen;
pub mod lifting;
pub mod program;
pub mod renaming;
pub mod reorder;
pub mod strictness;
pub mod syntax;

use syntax::Module;

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct CompilerOptions {
    /// Dump the compiled listing to the log
    pub debug: bool,
    /// Run the strictness analysis fixpoint before code generation. With
    /// analysis disabled the generated code still evaluates builtin
    /// arguments where required, but call sites lose the direct-evaluation
    /// fast path.
    pub strictness: bool,
}
impl Default for CompilerOptions {
    fn default() -> Self {
        Self {
            debug: false,
            strictness: true,
        }
    }
}
impl CompilerOptions {
    pub fn debug() -> Self {
        Self {
            debug: true,
            ..Default::default()
        }
    }
    pub fn unoptimized() -> Self {
        Self {
            debug: false,
            strictness: false,
        }
    }
}

pub struct Compiler {
    options: CompilerOptions,
}
impl Compiler {
    pub fn new(options: CompilerOptions) -> Self {
        Self { options }
    }
    pub fn options(&self) -> &CompilerOptions {
        &self.options
    }
    /// Run the full pipeline: renaming, lambda lifting, application
    /// lifting, letrec reordering, strictness analysis, code generation.
    /// The input module is consumed; the supercombinator set it contains
    /// after lifting is reflected in the output function table.
    pub fn compile(&self, module: Module) -> Result<bytecode::BytecodeModule, String> {
        let mut module = module;
        for sc in module.iter() {
            sc.body.validate_letrecs()?;
        }
        let mut names = renaming::NameGenerator::default();
        for index in 0..module.len() {
            renaming::rename_variables(module.get_mut(index), &mut names);
        }
        lifting::lift(&mut module, &mut names)?;
        lifting::applift(&mut module, &mut names)?;
        for index in 0..module.len() {
            reorder::reorder_letrecs(&mut module.get_mut(index).body);
        }
        if self.options.strictness {
            strictness::strictness_analysis(&mut module);
        }
        let compiled = codegen::generate(&module, &self.options)?;
        if self.options.debug {
            tracing::debug!(program = %compiled.instructions, "compiled program");
        }
        Ok(compiled)
    }
}
