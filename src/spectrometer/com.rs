//! TNMR automation backend.
//!
//! Late-bound OLE automation against `NTNMR.Application`. Every call is a
//! name lookup followed by `IDispatch::Invoke`; results are converted through
//! `BSTR` and parsed, since the application returns most numbers as text.

use super::{Spectrometer, SpectrometerError, SpectrometerResult};
use crate::model::ParamValue;
use std::path::{Path, PathBuf};
use windows::core::{BSTR, GUID, HSTRING, PCWSTR, VARIANT};
use windows::Win32::System::Com::{
    CLSIDFromProgID, CoCreateInstance, CoInitializeEx, IDispatch, CLSCTX_LOCAL_SERVER,
    COINIT_APARTMENTTHREADED, DISPATCH_FLAGS, DISPATCH_METHOD, DISPATCH_PROPERTYGET, DISPPARAMS,
};

const PROG_ID: &str = "NTNMR.Application";
const LOCALE_USER_DEFAULT: u32 = 0x0400;

pub struct TnmrAutomation {
    app: IDispatch,
}

impl TnmrAutomation {
    /// Attach to the running application (or start it) on the calling thread.
    pub fn connect() -> SpectrometerResult<Self> {
        unsafe {
            // S_FALSE means COM was already initialised on this thread.
            CoInitializeEx(None, COINIT_APARTMENTTHREADED)
                .ok()
                .map_err(|e| SpectrometerError::Connection(e.message().to_string()))?;
            let clsid = CLSIDFromProgID(&HSTRING::from(PROG_ID))
                .map_err(|e| SpectrometerError::Connection(e.message().to_string()))?;
            let app: IDispatch = CoCreateInstance(&clsid, None, CLSCTX_LOCAL_SERVER)
                .map_err(|e| SpectrometerError::Connection(e.message().to_string()))?;
            Ok(Self { app })
        }
    }

    fn dispid(&self, call: &'static str) -> SpectrometerResult<i32> {
        let name = HSTRING::from(call);
        let names = [PCWSTR(name.as_ptr())];
        let mut id = 0i32;
        unsafe {
            self.app
                .GetIDsOfNames(&GUID::zeroed(), names.as_ptr(), 1, LOCALE_USER_DEFAULT, &mut id)
                .map_err(|e| SpectrometerError::Call {
                    call,
                    message: e.message().to_string(),
                })?;
        }
        Ok(id)
    }

    /// Invoke `call` with positional `args` and return its result.
    fn invoke(&self, call: &'static str, args: Vec<VARIANT>) -> SpectrometerResult<VARIANT> {
        let id = self.dispid(call)?;
        // IDispatch expects arguments in reverse order.
        let mut args: Vec<VARIANT> = args.into_iter().rev().collect();
        let params = DISPPARAMS {
            rgvarg: args.as_mut_ptr(),
            rgdispidNamedArgs: std::ptr::null_mut(),
            cArgs: args.len() as u32,
            cNamedArgs: 0,
        };
        let mut result = VARIANT::default();
        unsafe {
            self.app
                .Invoke(
                    id,
                    &GUID::zeroed(),
                    LOCALE_USER_DEFAULT,
                    DISPATCH_FLAGS(DISPATCH_METHOD.0 | DISPATCH_PROPERTYGET.0),
                    &params,
                    Some(&mut result),
                    None,
                    None,
                )
                .map_err(|e| SpectrometerError::Call {
                    call,
                    message: e.message().to_string(),
                })?;
        }
        Ok(result)
    }

    fn invoke_text(&self, call: &'static str, args: Vec<VARIANT>) -> SpectrometerResult<String> {
        let v = self.invoke(call, args)?;
        BSTR::try_from(&v)
            .map(|b| b.to_string())
            .map_err(|e| SpectrometerError::Call {
                call,
                message: e.message().to_string(),
            })
    }

    fn invoke_bool(&self, call: &'static str) -> SpectrometerResult<bool> {
        let v = self.invoke(call, Vec::new())?;
        bool::try_from(&v).map_err(|e| SpectrometerError::Call {
            call,
            message: e.message().to_string(),
        })
    }
}

fn path_arg(path: &Path) -> VARIANT {
    VARIANT::from(BSTR::from(path.to_string_lossy().as_ref()))
}

fn text_arg(s: &str) -> VARIANT {
    VARIANT::from(BSTR::from(s))
}

fn value_arg(value: &ParamValue) -> VARIANT {
    match value {
        ParamValue::Int(v) => match i32::try_from(*v) {
            Ok(v) => VARIANT::from(v),
            Err(_) => VARIANT::from(*v as f64),
        },
        ParamValue::Float(v) => VARIANT::from(*v),
        ParamValue::Text(s) => text_arg(s),
    }
}

impl Spectrometer for TnmrAutomation {
    fn name(&self) -> &'static str {
        "tnmr"
    }

    fn active_doc_path(&self) -> SpectrometerResult<Option<PathBuf>> {
        let path = self.invoke_text("GetActiveDocPath", Vec::new())?;
        Ok((!path.trim().is_empty()).then(|| PathBuf::from(path)))
    }

    fn open_file(&mut self, path: &Path) -> SpectrometerResult<()> {
        self.invoke("OpenFile", vec![path_arg(path)]).map(drop)
    }

    fn close_file(&mut self, path: &Path) -> SpectrometerResult<()> {
        self.invoke("CloseFile", vec![path_arg(path)]).map(drop)
    }

    fn save_as(&mut self, path: &Path) -> SpectrometerResult<()> {
        self.invoke("SaveAs", vec![path_arg(path)]).map(drop)
    }

    fn get_param(&self, name: &str) -> SpectrometerResult<ParamValue> {
        let raw = self.invoke_text("GetNMRParameter", vec![text_arg(name)])?;
        Ok(ParamValue::parse_lenient(&raw))
    }

    fn set_param(&mut self, name: &str, value: &ParamValue) -> SpectrometerResult<()> {
        self.invoke("SetNMRParameter", vec![text_arg(name), value_arg(value)])
            .map(drop)
    }

    fn get_table(&self, name: &str) -> SpectrometerResult<String> {
        self.invoke_text("GetTable", vec![text_arg(name)])
    }

    fn set_table(&mut self, name: &str, values: &str) -> SpectrometerResult<()> {
        self.invoke("SetTable", vec![text_arg(name), text_arg(values)])
            .map(drop)
    }

    fn zero_and_go(&mut self) -> SpectrometerResult<()> {
        self.invoke("ZG", Vec::new()).map(drop)
    }

    fn check_acquisition(&self) -> SpectrometerResult<bool> {
        self.invoke_bool("CheckAcquisition")
    }

    fn abort(&mut self) -> SpectrometerResult<()> {
        self.invoke("Abort", Vec::new()).map(drop)
    }

    fn reset(&mut self) -> SpectrometerResult<()> {
        self.invoke("Reset", Vec::new()).map(drop)
    }
}
