fn main() {
    #[cfg(windows)]
    {
        use std::path::PathBuf;

        let Ok(manifest_dir) = std::env::var("CARGO_MANIFEST_DIR") else {
            return;
        };
        let ico_path = PathBuf::from(&manifest_dir).join("resources").join("devstack.ico");

        let mut res = winres::WindowsResource::new();
        res.set("FileDescription", "devstack daemon");
        res.set("ProductName", "devstack-core");
        // 아이콘은 있을 때만
        if let Some(ico) = ico_path.to_str().filter(|_| ico_path.exists()) {
            res.set_icon(ico);
        } else {
            println!("cargo:warning=Icon not found at {}, building without one", ico_path.display());
        }
        if let Err(e) = res.compile() {
            println!("cargo:warning=Failed to compile resources: {}", e);
        }
    }
}
