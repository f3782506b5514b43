//! Provisioning of the hosting environment on a managed application
//! platform. Every step is find-or-create, so a partially provisioned
//! account can be re-run safely. The platform API itself sits behind
//! [`ControlPlane`] and is injected by the caller.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::{sleep, Instant};
use tracing::{info, warn};

use crate::config::ProvisionConfig;

pub const APPLICATION_NAME: &str = "study-stats-application";
pub const SERVICE_ROLE: &str = "study-stats-eb-service-role";
pub const INSTANCE_PROFILE_ROLE: &str = "study-stats-eb-instance-profile-role";
pub const INSTANCE_PROFILE: &str = "study-stats-eb-instance-profile";

const SERVICE_POLICY: &str = "arn:aws:iam::aws:policy/service-role/AWSElasticBeanstalkService";
const ENHANCED_HEALTH_POLICY: &str =
    "arn:aws:iam::aws:policy/service-role/AWSElasticBeanstalkEnhancedHealth";
const MULTICONTAINER_DOCKER_POLICY: &str =
    "arn:aws:iam::aws:policy/AWSElasticBeanstalkMulticontainerDocker";
const WEB_TIER_POLICY: &str = "arn:aws:iam::aws:policy/AWSElasticBeanstalkWebTier";
const WORKER_TIER_POLICY: &str = "arn:aws:iam::aws:policy/AWSElasticBeanstalkWorkerTier";

const DESCRIBE_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Role {
    pub name: String,
    pub arn: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceProfile {
    pub name: String,
    pub arn: String,
    pub roles: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformSummary {
    pub arn: String,
    pub category: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvironmentDescription {
    pub id: String,
    pub name: String,
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OptionSetting {
    pub namespace: String,
    pub option_name: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateEnvironment {
    pub application_name: String,
    pub environment_name: String,
    pub description: String,
    pub platform_arn: String,
    pub option_settings: Vec<OptionSetting>,
}

/// The subset of the identity and application platform APIs the
/// provisioner needs.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    async fn find_role(&self, name: &str) -> anyhow::Result<Option<Role>>;
    async fn create_role(&self, name: &str, assume_role_policy: &str) -> anyhow::Result<()>;
    async fn attach_role_policy(&self, role: &str, policy_arn: &str) -> anyhow::Result<()>;
    async fn find_instance_profile(&self, name: &str) -> anyhow::Result<Option<InstanceProfile>>;
    async fn create_instance_profile(&self, name: &str) -> anyhow::Result<()>;
    async fn add_role_to_instance_profile(&self, profile: &str, role: &str) -> anyhow::Result<()>;
    async fn list_applications(&self) -> anyhow::Result<Vec<String>>;
    async fn create_application(&self, name: &str, description: &str) -> anyhow::Result<String>;
    async fn list_platforms(&self) -> anyhow::Result<Vec<PlatformSummary>>;
    async fn list_environments(&self) -> anyhow::Result<Vec<String>>;
    async fn create_environment(
        &self,
        request: &CreateEnvironment,
    ) -> anyhow::Result<EnvironmentDescription>;
    async fn describe_environments(
        &self,
        ids: &[String],
    ) -> anyhow::Result<Vec<EnvironmentDescription>>;
}

#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    #[error("environment {0} already exists")]
    EnvironmentExists(String),
    #[error("platform discovery failed: {0}")]
    PlatformDiscovery(String),
    #[error("no value generated for option {0}")]
    MissingSetting(String),
    #[error("generated options were never used: {0:?}")]
    UnusedSettings(Vec<String>),
    #[error("describe returned {0} environments, expected exactly one")]
    UnexpectedEnvironmentCount(usize),
    #[error("environment {name} deployment failed with status {status}")]
    DeploymentFailed { name: String, status: String },
    #[error("environment {name} was not ready after {waited:?}")]
    TimedOut { name: String, waited: Duration },
    #[error(transparent)]
    ControlPlane(#[from] anyhow::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvironmentStatus {
    Launching,
    Updating,
    Ready,
    Terminating,
    Terminated,
    Other(String),
}

impl From<&str> for EnvironmentStatus {
    fn from(status: &str) -> Self {
        match status {
            "Launching" => EnvironmentStatus::Launching,
            "Updating" => EnvironmentStatus::Updating,
            "Ready" => EnvironmentStatus::Ready,
            "Terminating" => EnvironmentStatus::Terminating,
            "Terminated" => EnvironmentStatus::Terminated,
            other => EnvironmentStatus::Other(other.to_string()),
        }
    }
}

/// An option in the environment template. Dynamic options are filled from
/// values generated during provisioning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplateValue {
    Fixed(&'static str),
    Dynamic,
}

pub const BASE_TEMPLATE: &[(&str, &str, TemplateValue)] = &[
    ("aws:elasticbeanstalk:environment", "EnvironmentType", TemplateValue::Fixed("LoadBalanced")),
    ("aws:elasticbeanstalk:environment", "ServiceRole", TemplateValue::Dynamic),
    ("aws:elasticbeanstalk:healthreporting:system", "SystemType", TemplateValue::Fixed("enhanced")),
    ("aws:autoscaling:asg", "MinSize", TemplateValue::Fixed("1")),
    ("aws:autoscaling:asg", "MaxSize", TemplateValue::Fixed("2")),
    ("aws:autoscaling:launchconfiguration", "IamInstanceProfile", TemplateValue::Dynamic),
    ("aws:autoscaling:launchconfiguration", "EC2KeyName", TemplateValue::Dynamic),
    ("aws:autoscaling:launchconfiguration", "InstanceType", TemplateValue::Dynamic),
    ("aws:cloudformation:template:parameter", "EnvironmentVariables", TemplateValue::Dynamic),
    ("aws:elasticbeanstalk:sns:topics", "Notification Endpoint", TemplateValue::Dynamic),
];

/// Resolves a template against generated values. Every dynamic option needs
/// a value and every generated value must be consumed.
pub fn build_option_settings(
    template: &[(&str, &str, TemplateValue)],
    mut generated: BTreeMap<String, String>,
) -> Result<Vec<OptionSetting>, ProvisionError> {
    let mut settings = Vec::with_capacity(template.len());
    for &(namespace, option_name, value) in template {
        let value = match value {
            TemplateValue::Fixed(value) => value.to_string(),
            TemplateValue::Dynamic => generated
                .remove(option_name)
                .ok_or_else(|| ProvisionError::MissingSetting(option_name.to_string()))?,
        };
        settings.push(OptionSetting {
            namespace: namespace.to_string(),
            option_name: option_name.to_string(),
            value,
        });
    }

    if !generated.is_empty() {
        return Err(ProvisionError::UnusedSettings(generated.into_keys().collect()));
    }
    Ok(settings)
}

fn service_assume_role_policy() -> String {
    serde_json::json!({
        "Version": "2012-10-17",
        "Statement": [{
            "Effect": "Allow",
            "Principal": {"Service": "elasticbeanstalk.amazonaws.com"},
            "Action": "sts:AssumeRole",
            "Condition": {"StringEquals": {"sts:ExternalId": "elasticbeanstalk"}}
        }]
    })
    .to_string()
}

fn instance_assume_role_policy() -> String {
    serde_json::json!({
        "Version": "2012-10-17",
        "Statement": [{
            "Effect": "Allow",
            "Principal": {"Service": "ec2.amazonaws.com"},
            "Action": "sts:AssumeRole"
        }]
    })
    .to_string()
}

pub struct Provisioner {
    client: Arc<dyn ControlPlane>,
    config: ProvisionConfig,
}

impl Provisioner {
    pub fn new(client: Arc<dyn ControlPlane>, config: ProvisionConfig) -> Self {
        Self { client, config }
    }

    async fn ensure_role(
        &self,
        name: &str,
        assume_role_policy: String,
        policies: &[&str],
    ) -> Result<Role, ProvisionError> {
        if self.client.find_role(name).await?.is_none() {
            info!(role = name, "role not found, creating");
            self.client.create_role(name, &assume_role_policy).await?;
        }
        for policy in policies {
            self.client.attach_role_policy(name, policy).await?;
        }
        self.client
            .find_role(name)
            .await?
            .ok_or_else(|| anyhow::anyhow!("role {name} missing after creation").into())
    }

    pub async fn ensure_service_role(&self) -> Result<Role, ProvisionError> {
        self.ensure_role(
            SERVICE_ROLE,
            service_assume_role_policy(),
            &[SERVICE_POLICY, ENHANCED_HEALTH_POLICY],
        )
        .await
    }

    pub async fn ensure_instance_profile_role(&self) -> Result<Role, ProvisionError> {
        self.ensure_role(
            INSTANCE_PROFILE_ROLE,
            instance_assume_role_policy(),
            &[MULTICONTAINER_DOCKER_POLICY, WEB_TIER_POLICY, WORKER_TIER_POLICY],
        )
        .await
    }

    /// Finds or creates the instance profile and makes sure it carries the
    /// instance profile role, repairing a profile left without it.
    pub async fn ensure_instance_profile(&self) -> Result<InstanceProfile, ProvisionError> {
        let profile = match self.client.find_instance_profile(INSTANCE_PROFILE).await? {
            Some(profile) => profile,
            None => {
                info!(profile = INSTANCE_PROFILE, "instance profile not found, creating");
                self.client.create_instance_profile(INSTANCE_PROFILE).await?;
                self.find_instance_profile().await?
            }
        };
        if profile.roles.iter().any(|role| role == INSTANCE_PROFILE_ROLE) {
            return Ok(profile);
        }

        let role = self.ensure_instance_profile_role().await?;
        info!(profile = INSTANCE_PROFILE, role = %role.name, "adding role to instance profile");
        self.client
            .add_role_to_instance_profile(INSTANCE_PROFILE, &role.name)
            .await?;
        self.find_instance_profile().await
    }

    async fn find_instance_profile(&self) -> Result<InstanceProfile, ProvisionError> {
        self.client
            .find_instance_profile(INSTANCE_PROFILE)
            .await?
            .ok_or_else(|| anyhow::anyhow!("instance profile missing after creation").into())
    }

    /// Reuses any application whose name contains ours, ignoring case.
    pub async fn ensure_application(&self) -> Result<String, ProvisionError> {
        for name in self.client.list_applications().await? {
            if name.to_lowercase().contains(APPLICATION_NAME) {
                info!(application = %name, "using existing application");
                return Ok(name);
            }
        }

        info!(application = APPLICATION_NAME, "creating application");
        Ok(self
            .client
            .create_application(APPLICATION_NAME, "Study statistics API")
            .await?)
    }

    /// The single platform matching the configured category and version.
    pub async fn discover_platform(&self) -> Result<String, ProvisionError> {
        let category = &self.config.platform_category;
        let version = &self.config.platform_version;
        let matches: Vec<String> = self
            .client
            .list_platforms()
            .await?
            .into_iter()
            .filter(|platform| {
                platform.category.as_deref() == Some(category.as_str())
                    && platform.arn.contains(version.as_str())
            })
            .map(|platform| platform.arn)
            .collect();

        match matches.as_slice() {
            [arn] => Ok(arn.clone()),
            [] => Err(ProvisionError::PlatformDiscovery(format!(
                "could not find a {category} {version} platform"
            ))),
            many => Err(ProvisionError::PlatformDiscovery(format!(
                "encountered multiple {category} {version} platforms: {many:?}"
            ))),
        }
    }

    pub async fn environment_exists(&self, name: &str) -> Result<bool, ProvisionError> {
        let wanted = name.to_lowercase();
        Ok(self
            .client
            .list_environments()
            .await?
            .iter()
            .any(|existing| existing.to_lowercase() == wanted))
    }

    async fn option_settings(&self) -> Result<Vec<OptionSetting>, ProvisionError> {
        let service_role = self.ensure_service_role().await?;
        let instance_profile = self.ensure_instance_profile().await?;

        let generated = BTreeMap::from([
            ("ServiceRole".to_string(), service_role.arn),
            ("IamInstanceProfile".to_string(), instance_profile.arn),
            (
                "EnvironmentVariables".to_string(),
                self.config.environment_variable_string(),
            ),
            ("EC2KeyName".to_string(), self.config.deployment_key_name.clone()),
            ("InstanceType".to_string(), self.config.instance_type.clone()),
            (
                "Notification Endpoint".to_string(),
                self.config.system_administrator_email.clone(),
            ),
        ]);
        build_option_settings(BASE_TEMPLATE, generated)
    }

    /// Creates the environment and blocks until it is ready or has failed.
    pub async fn create_environment(
        &self,
        name: &str,
    ) -> Result<EnvironmentDescription, ProvisionError> {
        if self.environment_exists(name).await? {
            return Err(ProvisionError::EnvironmentExists(name.to_string()));
        }

        let application_name = self.ensure_application().await?;
        let option_settings = self.option_settings().await?;
        let platform_arn = self.discover_platform().await?;

        info!(
            environment = name,
            region = %self.config.region,
            "creating environment, this will take a while"
        );
        let created = self
            .client
            .create_environment(&CreateEnvironment {
                application_name,
                environment_name: name.to_string(),
                description: "study statistics cluster".to_string(),
                platform_arn,
                option_settings,
            })
            .await?;

        self.wait_until_ready(&created).await
    }

    async fn wait_until_ready(
        &self,
        created: &EnvironmentDescription,
    ) -> Result<EnvironmentDescription, ProvisionError> {
        let started = Instant::now();
        let ids = vec![created.id.clone()];
        let client = self.client.as_ref();
        let ids = ids.as_slice();

        loop {
            let mut environments =
                with_retries(DESCRIBE_ATTEMPTS, self.config.poll_interval(), move || {
                    client.describe_environments(ids)
                })
                .await?;
            if environments.len() != 1 {
                return Err(ProvisionError::UnexpectedEnvironmentCount(environments.len()));
            }
            let environment = environments.remove(0);
            info!(
                environment = %environment.name,
                status = %environment.status,
                "waiting for environment to become Ready"
            );

            match EnvironmentStatus::from(environment.status.as_str()) {
                EnvironmentStatus::Ready => {
                    info!(environment = %environment.name, "environment is ready");
                    return Ok(environment);
                }
                EnvironmentStatus::Terminating | EnvironmentStatus::Terminated => {
                    return Err(ProvisionError::DeploymentFailed {
                        name: environment.name,
                        status: environment.status,
                    });
                }
                EnvironmentStatus::Launching
                | EnvironmentStatus::Updating
                | EnvironmentStatus::Other(_) => {}
            }

            if let Some(limit) = self.config.max_wait() {
                let waited = started.elapsed();
                if waited >= limit {
                    return Err(ProvisionError::TimedOut {
                        name: environment.name,
                        waited,
                    });
                }
            }
            sleep(self.config.poll_interval()).await;
        }
    }
}

/// Runs `call` up to `attempts` times, sleeping `delay` between failures.
async fn with_retries<T, F, Fut>(attempts: u32, delay: Duration, mut call: F) -> anyhow::Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let mut attempt = 1;
    loop {
        match call().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt < attempts => {
                warn!(attempt, error = %err, "control plane call failed, retrying");
                attempt += 1;
                sleep(delay).await;
            }
            Err(err) => return Err(err),
        }
    }
}
