// bog-embed - Engine implementation
// Copyright (c) 2025 Tom Waddington. MIT licensed.

//! The Engine struct - main entry point for embedding Bog.

use std::io;

use bog_parser::Errors;
use bog_vm::gc::Ref;
use bog_vm::{Error, Options, Result, Vm};

use crate::convert::{snapshot, to_ref, BogValue, FromBog};

/// The Bog scripting engine.
///
/// `Engine` owns a [`Vm`] and exposes evaluation, native registration and
/// value conversion without the host having to deal with GC handles.
///
/// # Thread Safety
///
/// **`Engine` is NOT thread-safe.** Create one instance per thread;
/// instances share no mutable state.
///
/// # Example
///
/// ```rust
/// use bog_embed::{BogValue, Engine};
///
/// let mut engine = Engine::new();
/// let result = engine.eval("return [1, 2, 3]").unwrap();
/// assert_eq!(result.to_string(), "[1, 2, 3]");
/// ```
pub struct Engine {
    vm: Vm,
    last_source: String,
    last_result: Option<Ref>,
}

impl Engine {
    /// Create an engine with default options (file imports disabled).
    pub fn new() -> Self {
        Self::with_options(Options::default())
    }

    pub fn with_options(options: Options) -> Self {
        Engine {
            vm: Vm::with_options(options),
            last_source: String::new(),
            last_result: None,
        }
    }

    /// Evaluate a string of Bog code and snapshot the module result.
    ///
    /// A module-level `err` value is returned as `BogValue::Err`, not as a
    /// host error; inspect it with [`BogValue::is_err`].
    pub fn eval(&mut self, source: &str) -> Result<BogValue> {
        self.last_source = source.to_string();
        let result = self.vm.compile_and_run(source, "eval")?;
        self.last_result = Some(result);
        Ok(snapshot(&self.vm.gc, result))
    }

    /// Evaluate and convert the result to a Rust type.
    pub fn eval_as<T: FromBog>(&mut self, source: &str) -> Result<T> {
        let value = self.eval(source)?;
        match T::from_bog(&value) {
            Some(converted) => Ok(converted),
            None => {
                self.vm
                    .errors
                    .push_error(format!("unexpected result value: {}", value), 0);
                Err(Error::Runtime)
            }
        }
    }

    /// Register a host function. Scripts refer to it by name; a declared
    /// arity is validated by the VM on every call.
    pub fn register_native<F>(&mut self, name: &str, arg_count: Option<u8>, func: F)
    where
        F: Fn(&[BogValue]) -> Result<BogValue> + 'static,
    {
        self.vm.register_native(name, arg_count, move |vm, args| {
            let owned: Vec<BogValue> = args.iter().map(|&r| snapshot(&vm.gc, r)).collect();
            let out = func(&owned)?;
            Ok(to_ref(vm, &out))
        });
    }

    /// Call a named function on the most recent evaluation result, which
    /// must be a map exporting that function.
    pub fn call(&mut self, name: &str, args: &[BogValue]) -> Result<BogValue> {
        let Some(target) = self.last_result else {
            self.vm
                .errors
                .push_error("nothing has been evaluated yet", 0);
            return Err(Error::Runtime);
        };
        let arg_refs: Vec<Ref> = args.iter().map(|v| to_ref(&mut self.vm, v)).collect();
        let result = self.vm.call_member(target, name, &arg_refs)?;
        Ok(snapshot(&self.vm.gc, result))
    }

    /// Render every diagnostic accumulated so far against the most recently
    /// evaluated source.
    pub fn render_errors(&self, out: &mut impl io::Write) -> io::Result<()> {
        self.vm.render_errors(&self.last_source, out)
    }

    pub fn errors(&self) -> &Errors {
        &self.vm.errors
    }

    /// Direct access to the underlying VM for advanced embedding.
    pub fn vm_mut(&mut self) -> &mut Vm {
        &mut self.vm
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}
