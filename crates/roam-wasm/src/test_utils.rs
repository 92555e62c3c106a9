//! Test utilities for behavior modules

pub mod test_modules {
    //! Behavior modules assembled from WAT for use in tests.

    use std::sync::OnceLock;

    /// The smallest valid behavior module: an entry point that does nothing
    /// and produces no reply.
    fn generate_idle_agent_wasm() -> Vec<u8> {
        wat::parse_str(
            r#"
            (module
              (func $_start)
              (export "_start" (func $_start)))
        "#,
        )
        .unwrap()
    }

    /// A WASI behavior module that writes a reply requesting its own
    /// destruction (with a final state) to stdout.
    fn generate_destroy_directive_wasm() -> Vec<u8> {
        wat::parse_str(
            r#"
            (module
              (import "wasi_snapshot_preview1" "fd_write"
                (func $fd_write (param i32 i32 i32 i32) (result i32)))
              (memory 1)
              (export "memory" (memory 0))
              (data (i32.const 64) "{\"state\":{\"done\":true},\"directive\":{\"kind\":\"destroy\"}}")
              (func $_start
                ;; iovec { ptr = 64, len = 54 } at offset 0
                (i32.store (i32.const 0) (i32.const 64))
                (i32.store (i32.const 4) (i32.const 54))
                (drop (call $fd_write
                  (i32.const 1)    ;; stdout
                  (i32.const 0)    ;; iovec array
                  (i32.const 1)    ;; one iovec
                  (i32.const 128)  ;; nwritten
                )))
              (export "_start" (func $_start)))
        "#,
        )
        .unwrap()
    }

    /// A module that demands filesystem access; the restrictive sandbox
    /// refuses it.
    fn generate_fs_agent_wasm() -> Vec<u8> {
        wat::parse_str(
            r#"
            (module
              (import "wasi_snapshot_preview1" "path_open"
                (func $path_open
                  (param i32 i32 i32 i32 i32 i64 i64 i32 i32) (result i32)))
              (memory 1)
              (export "memory" (memory 0))
              (func $_start)
              (export "_start" (func $_start)))
        "#,
        )
        .unwrap()
    }

    static IDLE_AGENT_WASM: OnceLock<Vec<u8>> = OnceLock::new();
    static DESTROY_DIRECTIVE_WASM: OnceLock<Vec<u8>> = OnceLock::new();
    static FS_AGENT_WASM: OnceLock<Vec<u8>> = OnceLock::new();

    /// A valid behavior module whose entry point does nothing
    pub fn idle_agent_wasm() -> &'static [u8] {
        IDLE_AGENT_WASM.get_or_init(generate_idle_agent_wasm)
    }

    /// A WASI behavior module replying with a destroy directive
    pub fn destroy_directive_wasm() -> &'static [u8] {
        DESTROY_DIRECTIVE_WASM.get_or_init(generate_destroy_directive_wasm)
    }

    /// A behavior module that requires filesystem capabilities
    pub fn fs_agent_wasm() -> &'static [u8] {
        FS_AGENT_WASM.get_or_init(generate_fs_agent_wasm)
    }

    /// Invalid bytes with a wrong magic number
    pub const INVALID_MAGIC_WASM: &[u8] = &[
        0xFF, 0xFF, 0xFF, 0xFF, // wrong magic
        0x01, 0x00, 0x00, 0x00, // version
    ];
}
