use crate::{AppConfigs, RabbitMQConfigs};

#[derive(Debug, Clone, Default)]
pub struct Configs<T: DynamicConfigs> {
    pub app: AppConfigs,
    pub rabbitmq: RabbitMQConfigs,

    pub dynamic: T,
}

pub trait DynamicConfigs: Default {
    fn load(&mut self);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Empty;
impl DynamicConfigs for Empty {
    fn load(&mut self) {}
}

impl<T> Configs<T>
where
    T: DynamicConfigs,
{
    pub fn rabbitmq_uri(&self) -> String {
        format!(
            "amqp://{}:{}@{}:{}{}",
            self.rabbitmq.user,
            self.rabbitmq.password,
            self.rabbitmq.host,
            self.rabbitmq.port,
            self.rabbitmq.vhost
        )
    }
}
