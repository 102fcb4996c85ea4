//! Host-facing operations: loading source, module search paths, running
//! script files and directories.

use crate::error::Error;
use crate::value::{NativeFn, NativeFunction, Value};
use crate::vm::Vm;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

impl Vm {
    /// Compile `src` into a function value without running it.
    pub fn load(&mut self, src: &str, chunk: &str) -> Result<Value, Error> {
        let proto = lunar_compiler::compile_with(src, chunk, self.compiler_config.clone())
            .map_err(|error| Error::Static {
                chunk: chunk.to_string(),
                error,
            })?;
        debug!(target: "lunar::state", chunk, "loaded chunk");
        let f = self.heap.alloc(crate::value::Closure {
            proto,
            upvalues: Vec::new(),
        });
        Ok(Value::Function(f))
    }

    /// Compile and run `src`, returning whatever the chunk returns.
    pub fn exec(&mut self, src: &str, chunk: &str) -> Result<Vec<Value>, Error> {
        let f = self.load(src, chunk)?;
        self.call(f, Vec::new())
    }

    /// Run one script file as a chunk named after its path.
    pub fn run_file(&mut self, path: impl AsRef<Path>) -> Result<Vec<Value>, Error> {
        let path = path.as_ref();
        let name = path.display().to_string();
        let src = std::fs::read_to_string(path).map_err(|source| Error::Io {
            path: name.clone(),
            source,
        })?;
        info!(target: "lunar::state", path = %name, "running script");
        self.exec(&src, &name)
    }

    /// Run a file, or every `*.lua` file directly inside a directory in
    /// lexical order. All files of a directory run even when some fail;
    /// the first failure is returned.
    pub fn run_path(&mut self, path: impl AsRef<Path>) -> Result<(), Error> {
        let path = path.as_ref();
        if !path.is_dir() {
            return self.run_file(path).map(|_| ());
        }
        let entries = std::fs::read_dir(path).map_err(|source| Error::Io {
            path: path.display().to_string(),
            source,
        })?;
        let mut scripts: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "lua"))
            .collect();
        scripts.sort();

        let mut first_error = None;
        for script in &scripts {
            if let Err(err) = self.run_file(script) {
                warn!(target: "lunar::state", path = %script.display(), error = %err, "script failed");
                first_error.get_or_insert(err);
            }
        }
        info!(
            target: "lunar::state",
            dir = %path.display(),
            scripts = scripts.len(),
            failed = first_error.is_some(),
            "directory finished"
        );
        first_error.map_or(Ok(()), Err)
    }

    // ── Modules ───────────────────────────────────────────────────────────────

    /// Register a module search prefix. `require("a.b")` tries
    /// `<prefix>/a/b.lua` then `<prefix>/a/b/init.lua` for every prefix in
    /// registration order.
    pub fn add_path(&mut self, prefix: impl AsRef<Path>) {
        let prefix = prefix.as_ref().display().to_string();
        let prefix = prefix.trim_end_matches('/');
        let prefix = if prefix.is_empty() { "." } else { prefix };
        self.paths.push(format!("{prefix}/?.lua"));
        self.paths.push(format!("{prefix}/?/init.lua"));
        let joined = self.paths.join(";");
        if let Value::Table(package) = self.global("package") {
            self.heap.get_mut(package).set_str("path", Value::from(joined));
        }
    }

    /// Templates `require` searches: `package.path` when scripts replaced it
    /// with a string, else the registered prefixes.
    fn search_templates(&self) -> Vec<String> {
        if let Value::Table(package) = self.global("package") {
            if let Value::Str(path) = self.heap.get(package).get_str("path") {
                return path
                    .split(';')
                    .filter(|t| !t.is_empty())
                    .map(str::to_string)
                    .collect();
            }
        }
        self.paths.clone()
    }

    /// Find a module file without loading it.
    pub fn search_module(&self, name: &str) -> Result<PathBuf, Error> {
        let relative = name.replace('.', "/");
        let mut tried = Vec::new();
        for template in self.search_templates() {
            let candidate = template.replace('?', &relative);
            if Path::new(&candidate).is_file() {
                return Ok(PathBuf::from(candidate));
            }
            tried.push(candidate);
        }
        Err(Error::ModuleNotFound {
            name: name.to_string(),
            tried,
        })
    }

    /// Load a module once; later calls return the cached value.
    pub fn require(&mut self, name: &str) -> Result<Value, Error> {
        let cached = self.heap.get(self.loaded).get_str(name);
        if !cached.is_nil() {
            return Ok(cached);
        }
        let path = self.search_module(name)?;
        let chunk_name = path.display().to_string();
        let src = std::fs::read_to_string(&path).map_err(|source| Error::Io {
            path: chunk_name.clone(),
            source,
        })?;
        debug!(target: "lunar::state", module = name, path = %chunk_name, "loading module");
        let chunk = self.load(&src, &chunk_name)?;
        let result = self.call(chunk, vec![Value::from(name), Value::from(chunk_name.as_str())])?;
        let value = match result.into_iter().next() {
            Some(v) if !v.is_nil() => v,
            _ => {
                // A module may fill `package.loaded` itself.
                let stored = self.heap.get(self.loaded).get_str(name);
                if stored.is_nil() {
                    Value::Boolean(true)
                } else {
                    stored
                }
            }
        };
        self.heap.get_mut(self.loaded).set_str(name, value.clone());
        Ok(value)
    }

    // ── Native boundary ───────────────────────────────────────────────────────

    /// Expose a Rust function as global `name`.
    pub fn register(&mut self, name: &str, func: NativeFn) {
        self.set_global(name, Value::Native(NativeFunction::new(name, func)));
    }

    pub fn set_global(&mut self, name: &str, value: Value) {
        self.heap.get_mut(self.globals).set_str(name, value);
    }

    pub fn global(&self, name: &str) -> Value {
        self.heap.get(self.globals).get_str(name)
    }

    /// Redirect `print` output.
    pub fn set_output(&mut self, out: Box<dyn Write>) {
        self.output = out;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[derive(Clone, Default)]
    struct Sink(Rc<RefCell<Vec<u8>>>);

    impl Write for Sink {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.borrow_mut().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn static_errors_name_the_chunk() {
        let err = Vm::new().exec("x = = 1", "bad.lua").unwrap_err();
        assert_eq!(err.kind(), "syntax");
        assert!(err.to_string().starts_with("bad.lua:1:"));
        let err = Vm::new().exec("break", "loop.lua").unwrap_err();
        assert_eq!(err.kind(), "compile");
    }

    #[test]
    fn print_goes_to_the_configured_sink() {
        let sink = Sink::default();
        let mut vm = Vm::new();
        vm.set_output(Box::new(sink.clone()));
        vm.exec("print('a', 1, nil, true)", "p").unwrap();
        assert_eq!(String::from_utf8_lossy(&sink.0.borrow()), "a\t1\tnil\ttrue\n");
    }

    #[test]
    fn registered_natives_are_callable() {
        fn double(_: &mut Vm, args: Vec<Value>) -> Result<Vec<Value>, Error> {
            let n = args.first().and_then(Value::as_number).unwrap_or(0.0);
            Ok(vec![Value::Number(n * 2.0)])
        }
        let mut vm = Vm::new();
        vm.register("double", double);
        let v = vm.exec("return double(21)", "n").unwrap();
        assert_eq!(v[0].as_number(), Some(42.0));
    }

    #[test]
    fn add_path_mirrors_package_path() {
        let mut vm = Vm::new();
        vm.add_path("lib/");
        let v = vm.exec("return package.path", "p").unwrap();
        assert_eq!(v[0].to_string(), "lib/?.lua;lib/?/init.lua");
    }

    #[test]
    fn missing_module_lists_every_candidate() {
        let mut vm = Vm::new();
        vm.add_path("nowhere");
        vm.add_path("elsewhere");
        match vm.require("pkg.mod") {
            Err(Error::ModuleNotFound { name, tried }) => {
                assert_eq!(name, "pkg.mod");
                assert_eq!(
                    tried,
                    vec![
                        "nowhere/pkg/mod.lua",
                        "nowhere/pkg/mod/init.lua",
                        "elsewhere/pkg/mod.lua",
                        "elsewhere/pkg/mod/init.lua",
                    ]
                );
            }
            other => panic!("unexpected: {other:?}"),
        }
    }
}
