//! Hot reload demo
//!
//! Loads `assets/demo.txt` (relative to the working directory) and reloads it
//! whenever the file changes on disk. Edit the file while this runs.
//!
//! ```text
//! cargo run -p kiln-resource --example hot_reload_demo --features hot-reload
//! ```

use std::sync::{Arc, RwLock};
use std::thread;
use std::time::Duration;

use kiln_resource::*;

/// A text file, reloaded in place.
struct TextAsset {
    content: RwLock<String>,
}

struct TextType;

impl TextType {
    fn decode(path: &ResourcePath, bytes: &[u8]) -> ResourceResult<String> {
        String::from_utf8(bytes.to_vec()).map_err(|e| ResourceError::invalid_data(path.as_str(), e.to_string()))
    }
}

impl ResourceType for TextType {
    fn create(&self, params: CreateParams<'_>) -> ResourceResult<()> {
        let content = Self::decode(params.path, params.bytes)?;
        params.descriptor.set_resource(Arc::new(TextAsset {
            content: RwLock::new(content),
        }));
        Ok(())
    }

    fn destroy(&self, _params: DestroyParams<'_>) -> ResourceResult<()> {
        Ok(())
    }

    fn recreate(&self, params: RecreateParams<'_>) -> ResourceResult<()> {
        let content = Self::decode(params.path, params.bytes)?;
        let asset = params
            .descriptor
            .resource_as::<TextAsset>()
            .ok_or_else(|| ResourceError::invalid_data(params.path.as_str(), "not a text asset"))?;
        if let Ok(mut current) = asset.content.write() {
            *current = content;
        }
        params.descriptor.set_resource_size(params.bytes.len() as u32);
        Ok(())
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    kiln_core::logging::init();

    std::fs::create_dir_all("assets")?;
    if !std::path::Path::new("assets/demo.txt").exists() {
        std::fs::write("assets/demo.txt", "Edit me!")?;
    }

    let factory = Factory::new(
        FactoryParams::new()
            .with_root("assets")
            .with_flags(FactoryFlags::RELOAD_SUPPORT),
    )?;
    factory.register_type("txt", TextType)?;
    factory.register_reloaded_callback(|event| {
        println!("Reloaded {} ({} bytes)", event.path(), event.descriptor.resource_size());
    });

    let demo = factory.get_as::<TextAsset>("/demo.txt")?;
    factory.enable_hot_reload()?;

    println!("Watching assets/demo.txt, press Ctrl+C to quit.");
    if let Ok(content) = demo.content.read() {
        println!("Current content: {}", content);
    }

    loop {
        if factory.process_hot_reload() > 0
            && let Ok(content) = demo.content.read()
        {
            println!("Current content: {}", content);
        }
        thread::sleep(Duration::from_millis(100));
    }
}
