#![no_main]
use libfuzzer_sys::fuzz_target;
use module_runtime::module::sandbox::{
    CodeScanner, DYNAMIC_COMMAND_OPERATION, PATH_OPERATION, REDIRECTION_OPERATION,
    SOURCE_OPERATION,
};

fuzz_target!(|data: &[u8]| {
    // Arbitrary script text must scan without panicking, and any reported
    // operation must be a blocked word or one of the structural rejections
    let code = String::from_utf8_lossy(data);
    let blocked = ["eval", "exec", "source", "sh", "read"];
    let scanner = CodeScanner::new(blocked);

    if let Some(operation) = scanner.scan(&code) {
        let structural = [
            PATH_OPERATION,
            REDIRECTION_OPERATION,
            DYNAMIC_COMMAND_OPERATION,
            SOURCE_OPERATION,
        ];
        assert!(
            blocked.contains(&operation.as_str()) || structural.contains(&operation.as_str())
        );
    }

    // Prefixing a blocked word always trips the scan
    let tainted = format!("eval {}", code);
    assert!(scanner.scan(&tainted).is_some());

    // A path separator anywhere is rejected
    let pathed = format!("{}/", code);
    assert!(scanner.scan(&pathed).is_some());
});
