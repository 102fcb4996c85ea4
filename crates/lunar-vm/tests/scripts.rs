//! Runs every `tests/scripts/*.lua` and compares what it prints with the
//! matching `.expected` file.

use lunar_vm::Vm;
use std::cell::RefCell;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::rc::Rc;

#[derive(Clone, Default)]
struct Capture(Rc<RefCell<Vec<u8>>>);

impl Write for Capture {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn scripts_dir() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/scripts")
}

fn run_script(path: &Path) -> String {
    let name = path.file_name().unwrap().to_string_lossy().into_owned();
    let src = std::fs::read_to_string(path).unwrap();
    let out = Capture::default();
    let mut vm = Vm::new();
    vm.set_output(Box::new(out.clone()));
    if let Err(err) = vm.exec(&src, &name) {
        panic!("{name} failed: {err}");
    }
    let bytes = out.0.borrow().clone();
    String::from_utf8(bytes).unwrap()
}

fn check(name: &str) {
    let script = scripts_dir().join(format!("{name}.lua"));
    let expected = std::fs::read_to_string(scripts_dir().join(format!("{name}.expected"))).unwrap();
    assert_eq!(run_script(&script), expected, "output of {name}.lua");
}

#[test]
fn closures() {
    check("closures");
}

#[test]
fn coroutines() {
    check("coroutines");
}

#[test]
fn errors() {
    check("errors");
}

#[test]
fn metatables() {
    check("metatables");
}

#[test]
fn strings() {
    check("strings");
}

#[test]
fn control() {
    check("control");
}

#[test]
fn every_script_has_expected_output() {
    let mut scripts: Vec<PathBuf> = std::fs::read_dir(scripts_dir())
        .unwrap()
        .map(|e| e.unwrap().path())
        .filter(|p| p.extension().is_some_and(|e| e == "lua"))
        .collect();
    scripts.sort();
    assert!(!scripts.is_empty());
    for script in scripts {
        assert!(
            script.with_extension("expected").is_file(),
            "{} has no .expected file",
            script.display()
        );
    }
}

#[test]
fn run_path_runs_a_directory_in_order() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("b.lua"), "print('second')").unwrap();
    std::fs::write(dir.path().join("a.lua"), "print('first') error('stop')").unwrap();
    std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();
    let out = Capture::default();
    let mut vm = Vm::new();
    vm.set_output(Box::new(out.clone()));
    let err = vm.run_path(dir.path()).unwrap_err();
    assert!(err.to_string().ends_with("a.lua:1: stop"));
    assert_eq!(String::from_utf8_lossy(&out.0.borrow()), "first\nsecond\n");
}
