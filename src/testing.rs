//! In-process fakes shared by unit tests

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use crate::adapters::vu1::{DialApi, Vu1Error, Vu1Result};
use crate::binding::DialDirectory;
use crate::dials::{Dial, DialInfo, DialSnapshot, DialStatus, EasingSettings};

#[derive(Default)]
struct FakeState {
    dials: Vec<DialInfo>,
    easing: HashMap<String, EasingSettings>,
    failing_status: HashSet<String>,
    list_error: Option<Vu1Error>,
    write_error: Option<Vu1Error>,
    failing_calls: HashMap<String, Vu1Error>,
    calls: Vec<String>,
}

/// Dial server double: keeps a dial list, reflects writes back into it and
/// records every write as a short call string ("value D1 50").
#[derive(Default)]
pub struct FakeDialServer {
    state: Mutex<FakeState>,
}

impl FakeDialServer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_dials(dials: &[(&str, &str)]) -> Arc<Self> {
        let server = Self::new();
        for (uid, name) in dials {
            server.add_dial(uid, name);
        }
        server
    }

    pub fn add_dial(&self, uid: &str, name: &str) {
        let mut state = self.state.lock().unwrap();
        state.dials.push(dial_info(uid, name));
        state.easing.insert(uid.to_string(), EasingSettings::default());
    }

    pub fn remove_dial(&self, uid: &str) {
        let mut state = self.state.lock().unwrap();
        state.dials.retain(|d| d.uid != uid);
    }

    /// Rename on the server side, as if done from another client
    pub fn rename(&self, uid: &str, name: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some(dial) = state.dials.iter_mut().find(|d| d.uid == uid) {
            dial.dial_name = name.to_string();
        }
    }

    pub fn set_easing(&self, uid: &str, easing: EasingSettings) {
        self.state
            .lock()
            .unwrap()
            .easing
            .insert(uid.to_string(), easing);
    }

    pub fn fail_status(&self, uid: &str) {
        self.state
            .lock()
            .unwrap()
            .failing_status
            .insert(uid.to_string());
    }

    pub fn fail_list(&self, error: Option<Vu1Error>) {
        self.state.lock().unwrap().list_error = error;
    }

    pub fn fail_writes(&self, error: Option<Vu1Error>) {
        self.state.lock().unwrap().write_error = error;
    }

    /// Fail only writes of one kind, e.g. "backlight_easing"
    pub fn fail_call(&self, kind: &str, error: Vu1Error) {
        self.state
            .lock()
            .unwrap()
            .failing_calls
            .insert(kind.to_string(), error);
    }

    pub fn name_of(&self, uid: &str) -> Option<String> {
        let state = self.state.lock().unwrap();
        state
            .dials
            .iter()
            .find(|d| d.uid == uid)
            .map(|d| d.dial_name.clone())
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn calls_starting_with(&self, prefix: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| c.starts_with(prefix))
            .collect()
    }

    pub fn clear_calls(&self) {
        self.state.lock().unwrap().calls.clear();
    }

    fn write(&self, call: String) -> Vu1Result<()> {
        let mut state = self.state.lock().unwrap();
        let kind = call.split(' ').next().unwrap_or_default().to_string();
        state.calls.push(call);
        match state.failing_calls.get(&kind).or(state.write_error.as_ref()) {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }
}

fn dial_info(uid: &str, name: &str) -> DialInfo {
    DialInfo {
        uid: uid.to_string(),
        dial_name: name.to_string(),
        value: 0,
        backlight: Default::default(),
        image_file: String::new(),
    }
}

/// A snapshot entry with a populated status
pub fn dial(uid: &str, name: &str) -> Dial {
    Dial {
        info: dial_info(uid, name),
        detailed_status: DialStatus::from_value(json!({ "value": 0 })),
    }
}

pub fn snapshot(dials: &[Dial]) -> DialSnapshot {
    dials
        .iter()
        .map(|d| (d.uid().to_string(), d.clone()))
        .collect()
}

#[async_trait]
impl DialApi for FakeDialServer {
    async fn get_dial_list(&self) -> Vu1Result<Vec<DialInfo>> {
        let state = self.state.lock().unwrap();
        match &state.list_error {
            Some(e) => Err(e.clone()),
            None => Ok(state.dials.clone()),
        }
    }

    async fn get_dial_status(&self, dial_id: &str) -> Vu1Result<DialStatus> {
        let state = self.state.lock().unwrap();
        if state.failing_status.contains(dial_id) {
            return Err(Vu1Error::Connection("status timed out".to_string()));
        }
        let Some(info) = state.dials.iter().find(|d| d.uid == dial_id) else {
            return Err(Vu1Error::Api(format!("Unknown dial {}", dial_id)));
        };
        let easing = state.easing.get(dial_id).copied().unwrap_or_default();
        Ok(DialStatus::from_value(json!({
            "uid": info.uid,
            "dial_name": info.dial_name,
            "value": info.value,
            "easing": {
                "dial_period": easing.dial_period,
                "dial_step": easing.dial_step,
                "backlight_period": easing.backlight_period,
                "backlight_step": easing.backlight_step,
            },
        })))
    }

    async fn set_dial_value(&self, dial_id: &str, value: i64) -> Vu1Result<()> {
        self.write(format!("value {} {}", dial_id, value))?;
        let mut state = self.state.lock().unwrap();
        if let Some(dial) = state.dials.iter_mut().find(|d| d.uid == dial_id) {
            dial.value = value.clamp(0, 100) as u8;
        }
        Ok(())
    }

    async fn set_dial_backlight(
        &self,
        dial_id: &str,
        red: i64,
        green: i64,
        blue: i64,
    ) -> Vu1Result<()> {
        self.write(format!("backlight {} {} {} {}", dial_id, red, green, blue))
    }

    async fn set_dial_name(&self, dial_id: &str, name: &str) -> Vu1Result<()> {
        self.write(format!("name {} {}", dial_id, name))?;
        self.rename(dial_id, name);
        Ok(())
    }

    async fn set_dial_easing(&self, dial_id: &str, period: u32, step: u32) -> Vu1Result<()> {
        self.write(format!("dial_easing {} {} {}", dial_id, period, step))?;
        let mut state = self.state.lock().unwrap();
        let easing = state.easing.entry(dial_id.to_string()).or_default();
        easing.dial_period = period;
        easing.dial_step = step;
        Ok(())
    }

    async fn set_backlight_easing(&self, dial_id: &str, period: u32, step: u32) -> Vu1Result<()> {
        self.write(format!("backlight_easing {} {} {}", dial_id, period, step))?;
        let mut state = self.state.lock().unwrap();
        let easing = state.easing.entry(dial_id.to_string()).or_default();
        easing.backlight_period = period;
        easing.backlight_step = step;
        Ok(())
    }

    async fn reload_dial(&self, dial_id: &str) -> Vu1Result<()> {
        self.write(format!("reload {}", dial_id))
    }

    async fn calibrate_dial(&self, dial_id: &str, value: i64) -> Vu1Result<()> {
        self.write(format!("calibrate {} {}", dial_id, value))
    }

    async fn get_dial_image(&self, dial_id: &str) -> Vu1Result<Vec<u8>> {
        self.write(format!("get_image {}", dial_id))?;
        Ok(b"\x89PNG".to_vec())
    }

    async fn set_dial_image(&self, dial_id: &str, image: Vec<u8>) -> Vu1Result<()> {
        self.write(format!("set_image {} {}", dial_id, image.len()))
    }

    async fn provision_new_dials(&self) -> Vu1Result<Value> {
        self.write("provision".to_string())?;
        Ok(json!({ "status": "ok", "data": [] }))
    }
}

/// Directory over a fixed set of dials, all served by one client
pub struct StaticDirectory {
    client: Arc<FakeDialServer>,
    dials: Mutex<DialSnapshot>,
}

impl StaticDirectory {
    pub fn new(client: Arc<FakeDialServer>, dials: DialSnapshot) -> Arc<Self> {
        Arc::new(Self {
            client,
            dials: Mutex::new(dials),
        })
    }
}

#[async_trait]
impl DialDirectory for StaticDirectory {
    async fn client_for(&self, dial_id: &str) -> Option<Arc<dyn DialApi>> {
        let known = self.dials.lock().unwrap().contains_key(dial_id);
        known.then(|| self.client.clone() as Arc<dyn DialApi>)
    }

    async fn dial(&self, dial_id: &str) -> Option<Dial> {
        self.dials.lock().unwrap().get(dial_id).cloned()
    }
}
