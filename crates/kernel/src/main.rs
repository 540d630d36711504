#![cfg_attr(target_os = "none", no_std, no_main)]

#[cfg(target_os = "none")]
#[panic_handler]
fn rust_panic(info: &core::panic::PanicInfo) -> ! {
    halcyon_kernel::handle_panic(info)
}

// The kernel only runs freestanding; hosted builds exist so the workspace tests.
#[cfg(not(target_os = "none"))]
fn main() {}
