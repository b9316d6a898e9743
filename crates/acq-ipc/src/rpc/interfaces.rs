//! Registration of the capability traits from `acq_core::capabilities`.
//!
//! Each function adds one capability's methods. Capabilities that extend
//! another call its function first; repeated registration is deduplicated by
//! the registry, so composing `Camera` and `FlowControl` registers
//! `StartStop` once.

use acq_core::{
    Camera, CameraControl, OutputFileAndPipe, StartStop, VideoSettingsDynamic, VideoSettingsStatic,
};
use once_cell::sync::Lazy;

use super::registry::{InterfaceSignature, MethodRegistry};

/// Method names shared by servers and proxies.
pub mod methods {
    /// `StartStop::start`
    pub const START: &str = "start";
    /// `StartStop::stop`
    pub const STOP: &str = "stop";
    /// `StartStop::is_running`
    pub const IS_RUNNING: &str = "is_running";
    /// `OutputFileAndPipe::set_output_file`
    pub const SET_OUTPUT_FILE: &str = "set_output_file";
    /// `OutputFileAndPipe::flush_output_file`
    pub const FLUSH_OUTPUT_FILE: &str = "flush_output_file";
    /// `OutputFileAndPipe::set_output_pipe`
    pub const SET_OUTPUT_PIPE: &str = "set_output_pipe";
    /// `Camera::attributes`
    pub const ATTRIBUTES: &str = "attributes";
    /// `Camera::settings_static`
    pub const SETTINGS_STATIC: &str = "settings_static";
    /// `Camera::set_settings_static`
    pub const SET_SETTINGS_STATIC: &str = "set_settings_static";
    /// `Camera::settings_dynamic`
    pub const SETTINGS_DYNAMIC: &str = "settings_dynamic";
    /// `Camera::set_settings_dynamic`
    pub const SET_SETTINGS_DYNAMIC: &str = "set_settings_dynamic";
}

use methods::*;

/// Register `StartStop`.
pub fn register_start_stop<I: StartStop + ?Sized + 'static>(registry: &mut MethodRegistry<I>) {
    let _ = registry
        .capability("StartStop")
        .method(START, &[], |t: &I, (): ()| t.start())
        .method(STOP, &[], |t: &I, (): ()| t.stop())
        .method(IS_RUNNING, &[], |t: &I, (): ()| t.is_running());
}

/// Register `OutputFileAndPipe`.
pub fn register_output<I: OutputFileAndPipe + ?Sized + 'static>(registry: &mut MethodRegistry<I>) {
    let _ = registry
        .capability("OutputFileAndPipe")
        .method(SET_OUTPUT_FILE, &["path"], |t: &I, (path,): (String,)| {
            t.set_output_file(&path)
        })
        .method(FLUSH_OUTPUT_FILE, &[], |t: &I, (): ()| t.flush_output_file())
        .method(SET_OUTPUT_PIPE, &["name"], |t: &I, (name,): (String,)| {
            t.set_output_pipe(&name)
        });
}

/// Register `Camera`, including `StartStop`.
pub fn register_camera<I: Camera + ?Sized + 'static>(registry: &mut MethodRegistry<I>) {
    register_start_stop(registry);
    let _ = registry
        .capability("Camera")
        .method(ATTRIBUTES, &[], |t: &I, (): ()| t.attributes())
        .method(SETTINGS_STATIC, &[], |t: &I, (): ()| t.settings_static())
        .method(
            SET_SETTINGS_STATIC,
            &["settings"],
            |t: &I, (settings,): (VideoSettingsStatic,)| t.set_settings_static(settings),
        )
        .method(SETTINGS_DYNAMIC, &[], |t: &I, (): ()| t.settings_dynamic())
        .method(
            SET_SETTINGS_DYNAMIC,
            &["settings"],
            |t: &I, (settings,): (VideoSettingsDynamic,)| t.set_settings_dynamic(settings),
        );
}

/// Registry for a camera flow: `Camera` plus `OutputFileAndPipe`.
#[must_use]
pub fn camera_flow_registry<I: CameraControl + ?Sized + 'static>() -> MethodRegistry<I> {
    let mut registry = MethodRegistry::new();
    register_camera(&mut registry);
    register_output(&mut registry);
    registry
}

/// Signature of [`camera_flow_registry`], used by camera proxies.
pub static CAMERA_FLOW_SIGNATURE: Lazy<InterfaceSignature> =
    Lazy::new(|| camera_flow_registry::<dyn CameraControl>().into_signature());
