use fail::FailScenario;

/// Serializes fail point tests and turns every configured fail point off when dropped.
pub struct CascadeFailScenario<'a> {
    _scenario: FailScenario<'a>,
    failpoints: Vec<String>,
}

impl<'a> CascadeFailScenario<'a> {
    pub fn setup(failpoints: &[(&str, &str)]) -> CascadeFailScenario<'a> {
        let mut scenario = CascadeFailScenario {
            _scenario: FailScenario::setup(),
            failpoints: Vec::new(),
        };
        for (failpoint, action) in failpoints {
            scenario.configure(failpoint, action);
        }

        scenario
    }

    /// Arms `failpoint` with a fail crate action such as `1*return(timed_retry)`.
    pub fn configure(&mut self, failpoint: &str, action: &str) {
        fail::cfg(failpoint, action).unwrap();
        self.failpoints.push(failpoint.to_string());
    }

    pub fn teardown(self) {
        drop(self);
    }
}

impl Drop for CascadeFailScenario<'_> {
    fn drop(&mut self) {
        for failpoint in &self.failpoints {
            fail::cfg(failpoint, "off").unwrap()
        }
    }
}
