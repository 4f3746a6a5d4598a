#![no_main]
use libfuzzer_sys::fuzz_target;
use module_runtime::module::registry::ModuleManifest;
use module_runtime::module::validation::ManifestValidator;

fuzz_target!(|data: &[u8]| {
    // Manifests come from untrusted artifacts; parsing must never panic

    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };

    if let Ok(manifest) = ModuleManifest::parse(text) {
        // Accepted manifests always carry a name and an entry point
        assert!(!manifest.name.is_empty());
        assert!(!manifest.entry_point.is_empty());

        let _ = ManifestValidator::new().validate(&manifest);

        let (hooks, unknown) = manifest.declared_hooks();
        assert!(hooks.names().len() + unknown.len() <= manifest.hooks.len());
        let _ = manifest.factory_name();
    }
});
