use std::env;
use std::fs;
use std::path::{Path, PathBuf};

const HEADERS: &[&str] = &["infiniband/verbs.h", "rdma/rdma_cma.h"];

fn include_dir() -> PathBuf {
    env::var_os("RDMA_CORE_INCLUDE_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/usr/include"))
}

fn main() {
    println!("cargo:rerun-if-env-changed=RDMA_CORE_INCLUDE_DIR");
    println!("cargo:rerun-if-changed=wrapper.h");
    println!("cargo:rustc-check-cfg=cfg(has_rdma_core)");

    let out_path = PathBuf::from(env::var("OUT_DIR").expect("OUT_DIR is set by cargo"));
    let include = include_dir();
    let missing: Vec<_> = HEADERS
        .iter()
        .filter(|h| !Path::new(&include).join(h).exists())
        .collect();
    if !missing.is_empty() {
        // without rdma-core development headers there is nothing to bind against; the crate
        // builds empty so that workspace-wide builds still succeed.
        println!(
            "cargo:warning=rdma-core headers {:?} not found under {}; building without bindings",
            missing,
            include.display()
        );
        fs::write(out_path.join("bindings.rs"), "").expect("Could not write bindings");
        return;
    }

    println!("cargo:include={}", include.display());
    println!("cargo:rustc-link-lib=ibverbs");
    println!("cargo:rustc-link-lib=rdmacm");
    println!("cargo:rustc-cfg=has_rdma_core");

    // generate the bindings
    eprintln!("run bindgen");
    let bindings = bindgen::Builder::default()
        .header("wrapper.h")
        .clang_arg(format!("-I{}", include.display()))
        .allowlist_function("ibv_.*")
        .allowlist_function("_ibv_.*")
        .allowlist_function("rdma_.*")
        .allowlist_type("ibv_.*")
        .allowlist_type("rdma_.*")
        .allowlist_var("IBV_LINK_LAYER_.*")
        .bitfield_enum("ibv_access_flags")
        .bitfield_enum("ibv_port_cap_flags")
        .bitfield_enum("ibv_qp_attr_mask")
        .bitfield_enum("ibv_send_flags")
        .bitfield_enum("ibv_wc_flags")
        .constified_enum_module("ibv_wc_status")
        .constified_enum_module("ibv_wc_opcode")
        .constified_enum_module("rdma_cm_event_type")
        .constified_enum_module("rdma_port_space")
        .default_enum_style(bindgen::EnumVariation::Rust {
            non_exhaustive: false,
        })
        .derive_default(true)
        .derive_debug(true)
        .prepend_enum_name(false)
        .blocklist_type("ibv_wc")
        .size_t_is_usize(true)
        .generate()
        .expect("Unable to generate bindings");

    bindings
        .write_to_file(out_path.join("bindings.rs"))
        .expect("Could not write bindings");
}
