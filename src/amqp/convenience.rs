use lapin::{types::AMQPValue, BasicProperties};

/// Set the value for a header inside a collection of AMQP properties.
///
/// # Implementation notes
///
/// `lapin` does not give mutable access to the headers of [`BasicProperties`]: they are
/// cloned. `properties` is consumed to make sure the caller does not re-use it under the
/// impression that it has been mutated to add the new header.
///
/// # Example
///
/// ```rust
/// use carrot_hutch::amqp::types::{AMQPValue, ShortString};
/// use carrot_hutch::amqp::{BasicProperties, convenience::set_header};
///
/// // Empty set of headers
/// let properties = BasicProperties::default();
///
/// let header_name = "MyHeaderName";
/// // AMQP has various string types - see https://www.rabbitmq.com/amqp-0-9-1-reference.html#domains
/// let header_value = AMQPValue::LongString(header_name.into());
///
/// // `set_header` consumes `properties` and returns the updated collection
/// let properties = set_header(properties, header_name, header_value.clone());
///
/// // Assert
/// let headers = properties.headers().as_ref().unwrap().inner();
/// let header_name: ShortString = header_name.into();
/// assert_eq!(&header_value, headers.get(&header_name).unwrap());
/// ```
pub fn set_header(
    properties: BasicProperties,
    header_name: &str,
    header_value: AMQPValue,
) -> BasicProperties {
    let mut headers = properties
        .headers()
        .as_ref()
        .map(|h| h.to_owned())
        .unwrap_or_default();
    headers.insert(header_name.into(), header_value);
    properties.with_headers(headers)
}
